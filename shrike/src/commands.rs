// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::PublishPacket;

/// Commands other tasks may enqueue to a connection's command queue.
///
/// The connection task is the queue's only consumer, so everything the
/// subscriber observes went through this single funnel in order.
#[derive(Debug, Clone)]
pub enum ConnectionCmd {
    /// Deliver a publish to this connection's client. QoS is already clamped
    /// by the router; the packet id is assigned by the connection task.
    Publish(PublishPacket),

    /// Close this connection, e.g. `"old conn"` when a newer CONNECT with
    /// the same client id displaces it.
    Close(&'static str),
}
