// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{ConnectPacket, PublishPacket, SubscribeTopic};

use crate::error::Error;

/// Host hooks into the broker's connection life cycle.
///
/// Callbacks run on the connection task; heavy work belongs in a task of the
/// host's own.
pub trait EventListener: Send + Sync {
    /// Called after a connection completed the CONNECT handshake. Returning
    /// an error closes the connection.
    ///
    /// # Errors
    ///
    /// Return an error to reject the established connection.
    fn on_connected(&self, _connect: &ConnectPacket) -> Result<(), Error> {
        Ok(())
    }

    /// Called for every publish admitted from a client.
    fn on_publish_received(&self, _publish: &PublishPacket) {}

    /// Called with the granted filters of a SUBSCRIBE.
    fn on_subscribe_success(&self, _topics: &[SubscribeTopic]) {}

    /// Called with the filter strings of an UNSUBSCRIBE.
    fn on_unsubscribe_success(&self, _topics: &[String]) {}

    /// Called when a connection is released.
    fn on_disconnected(&self) {}
}

/// Listener used until the host installs one. Accepts everything, observes
/// nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultListener;

impl EventListener for DefaultListener {}
