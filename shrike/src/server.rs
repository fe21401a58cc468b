// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use codec::{PacketId, PublishPacket};
use futures_util::future;
use session::Persister;

use crate::commands::ConnectionCmd;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::events::{DefaultListener, EventListener};
use crate::listener;
use crate::registry::{ConnRegistry, FilterCache, RetainRegistry};
use crate::stream::Transport;
use crate::types::ConnectionId;

/// Username/password predicate installed by the host.
pub type Authenticator = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// State shared by every connection task of one broker.
pub(crate) struct ServerContext {
    pub conn_registry: ConnRegistry,
    pub retain_registry: RetainRegistry,
    pub filter_cache: FilterCache,
    pub persister: Arc<dyn Persister>,
    pub connect_timeout_secs: u64,

    authenticator: RwLock<Option<Authenticator>>,
    events: RwLock<Box<dyn EventListener>>,
    next_connection_id: AtomicU64,
    next_packet_id: AtomicU16,
}

impl ServerContext {
    /// Run the host's authenticator over the presented credentials. With no
    /// authenticator installed, access is granted.
    pub fn authenticate(&self, username: &str, password: &[u8]) -> bool {
        match read_lock(&self.authenticator).as_ref() {
            Some(authenticator) => authenticator(username, password),
            None => true,
        }
    }

    /// Call into the host's event listener.
    pub fn with_events<T>(&self, f: impl FnOnce(&dyn EventListener) -> T) -> T {
        f(read_lock(&self.events).as_ref())
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh packet id for outbound QoS 1/2 publishes, drawn from one
    /// broker-wide counter. Zero is not a legal packet id and is skipped.
    pub fn next_packet_id(&self) -> PacketId {
        let mut id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        }
        PacketId::new(id)
    }

    /// Update the retain registry if the packet is retained, then fan out to
    /// every matching subscription except the publisher's.
    pub async fn route_publish(&self, packet: &PublishPacket, exclude_id: &str) {
        if packet.retain() {
            self.retain_registry.store(packet);
        }
        self.conn_registry
            .publish(packet, exclude_id, &self.filter_cache)
            .await;
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A broker instance.
///
/// Accepts network connections from clients, accepts Application Messages
/// published by clients, processes subscribe and unsubscribe requests, and
/// forwards Application Messages that match client subscriptions.
///
/// Cloning is cheap and yields another handle onto the same broker.
#[derive(Clone)]
pub struct Broker {
    context: Arc<ServerContext>,
}

impl Broker {
    /// Create a broker backed by `persister`. Retained messages are loaded
    /// from the persister immediately; a failing persister logs and starts
    /// empty.
    #[must_use]
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self::with_connect_timeout(persister, 10)
    }

    /// As [`Broker::new`], with a non-default CONNECT handshake deadline.
    #[must_use]
    pub fn with_connect_timeout(persister: Arc<dyn Persister>, connect_timeout_secs: u64) -> Self {
        let retain_registry = RetainRegistry::load(Arc::clone(&persister));
        Self {
            context: Arc::new(ServerContext {
                conn_registry: ConnRegistry::new(),
                retain_registry,
                filter_cache: FilterCache::new(),
                persister,
                connect_timeout_secs,
                authenticator: RwLock::new(None),
                events: RwLock::new(Box::new(DefaultListener)),
                next_connection_id: AtomicU64::new(1),
                next_packet_id: AtomicU16::new(1),
            }),
        }
    }

    /// Install a username/password check, run whenever a CONNECT carries a
    /// username. Without one, every CONNECT is accepted.
    pub fn set_authenticator<F>(&self, authenticator: F)
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        *write_lock(&self.context.authenticator) = Some(Box::new(authenticator));
    }

    /// Install the host's event listener, replacing the default no-op one.
    pub fn set_event_listener<L>(&self, events: L)
    where
        L: EventListener + 'static,
    {
        *write_lock(&self.context.events) = Box::new(events);
    }

    /// Enqueue `packet` to the client connected as `client_id`. Dropped
    /// silently when no such client is connected.
    pub async fn publish(&self, packet: PublishPacket, client_id: &str) {
        if let Some(handle) = self.context.conn_registry.get(client_id) {
            let _ = handle.sender.send(ConnectionCmd::Publish(packet)).await;
        }
    }

    /// Drive the MQTT protocol over one accepted stream until it closes.
    /// The connection task is spawned; the call returns immediately.
    pub fn serve_stream<T>(&self, stream: T) -> tokio::task::JoinHandle<()>
    where
        T: Transport + 'static,
    {
        let connection = Connection::new(Arc::clone(&self.context), stream);
        tokio::spawn(connection.run_loop())
    }

    /// Bind every configured listener and accept connections until one of
    /// them fails.
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot bind or its accept loop dies.
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let mut accept_loops = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            accept_loops.push(listener::serve_listener(self.clone(), listener_config.clone()));
        }
        future::try_join_all(accept_loops).await.map(|_| ())
    }
}
