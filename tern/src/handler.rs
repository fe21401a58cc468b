// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{PublishPacket, SubscribeTopic};

/// How received messages and connection events reach the host application.
///
/// Callbacks run on the client's connection task, so they should hand heavy
/// work off to the host's own tasks. Only `on_message` is mandatory; a plain
/// closure over a `PublishPacket` implements the trait.
pub trait MessageHandler: Send + Sync {
    /// An Application Message arrived for one of this client's
    /// subscriptions. QoS 2 duplicates are filtered out before this is
    /// called.
    fn on_message(&self, publish: &PublishPacket);

    /// A SUBSCRIBE completed; `topics` holds the filters the broker
    /// granted.
    fn on_subscribe_success(&self, _topics: &[SubscribeTopic]) {}

    /// An UNSUBSCRIBE completed.
    fn on_unsubscribe_success(&self, _topics: &[String]) {}

    /// The connection is gone, cleanly or not. The session has been saved
    /// at this point.
    fn on_disconnected(&self) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&PublishPacket) + Send + Sync,
{
    fn on_message(&self, publish: &PublishPacket) {
        self(publish);
    }
}
