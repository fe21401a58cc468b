// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use codec::{PublishPacket, QoS, SubscribeTopic, Topic, TopicError};
use session::{Persister, Session, KEY_BROKER_RETAIN};
use tokio::sync::mpsc::Sender;

use crate::commands::ConnectionCmd;
use crate::types::ConnectionId;

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

/// What the broker keeps of an active connection: the command queue plus the
/// shared session, keyed by client id. The owning task holds everything
/// else; once it goes away the sender merely errors and routing skips it.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    pub client_id: String,
    pub sender: Sender<ConnectionCmd>,
    pub session: Arc<Session>,
}

/// Active connections by client id. At most one `Active` connection per
/// client id; a newer CONNECT displaces the previous holder.
#[derive(Debug, Default)]
pub(crate) struct ConnRegistry {
    conns: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, returning the handle it displaced, if any. The
    /// caller closes the displaced connection.
    #[must_use]
    pub fn add(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        write_lock(&self.conns).insert(handle.client_id.clone(), handle)
    }

    /// Deregister `client_id`, but only if the entry still belongs to the
    /// connection identified by `id`. A displaced connection calling in
    /// after its successor registered must not remove the successor.
    pub fn remove(&self, client_id: &str, id: ConnectionId) {
        let mut conns = write_lock(&self.conns);
        if conns.get(client_id).is_some_and(|handle| handle.id == id) {
            conns.remove(client_id);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        read_lock(&self.conns).get(client_id).cloned()
    }

    /// Route `packet` to every registered connection, excluding the
    /// publisher, whose subscription list matches the topic. Each copy has
    /// its QoS clamped to the matching filter's maximum and the retain flag
    /// cleared; delivery waits on full queues, closed queues are skipped.
    pub async fn publish(&self, packet: &PublishPacket, exclude_id: &str, cache: &FilterCache) {
        let targets: Vec<(Sender<ConnectionCmd>, QoS)> = {
            let conns = read_lock(&self.conns);
            conns
                .values()
                .filter(|handle| handle.client_id != exclude_id)
                .filter_map(|handle| {
                    matched_qos(&handle.session.subscriptions(), packet.topic(), cache)
                        .map(|max_qos| (handle.sender.clone(), max_qos))
                })
                .collect()
        };

        for (sender, max_qos) in targets {
            let mut copy = packet.clone();
            copy.set_retain(false);
            if copy.qos() > max_qos {
                copy.set_qos(max_qos);
            }
            // A closed queue means the connection died between the lookup
            // and the send; nothing to do.
            let _ = sender.send(ConnectionCmd::Publish(copy)).await;
        }
    }
}

/// First matching filter decides whether and at which maximum QoS the
/// client receives the message.
fn matched_qos(subscriptions: &[SubscribeTopic], topic: &str, cache: &FilterCache) -> Option<QoS> {
    for sub in subscriptions {
        match cache.get(sub.topic()) {
            Ok(filter) => {
                if filter.is_match(topic) {
                    return Some(sub.qos());
                }
            }
            Err(err) => {
                log::warn!("registry: Bad filter {:?} in session: {err}", sub.topic());
            }
        }
    }
    None
}

/// Latest retained message per topic, mirrored write-through into the
/// persister under `mq:sr`.
pub(crate) struct RetainRegistry {
    retained: RwLock<HashMap<String, PublishPacket>>,
    persister: Arc<dyn Persister>,
}

impl RetainRegistry {
    /// Create the registry, loading previously persisted retained messages.
    /// Unreadable records are dropped with a log line.
    pub fn load(persister: Arc<dyn Persister>) -> Self {
        let mut retained = HashMap::new();
        match persister.load_all(KEY_BROKER_RETAIN) {
            Ok(records) => {
                for (topic, blob) in records {
                    match serde_json::from_slice::<PublishPacket>(&blob) {
                        Ok(packet) => {
                            retained.insert(topic, packet);
                        }
                        Err(err) => {
                            log::warn!("retain: Drop unreadable record for {topic:?}: {err}");
                        }
                    }
                }
            }
            Err(err) => {
                log::error!("retain: Failed to load retained messages: {err}");
            }
        }

        Self {
            retained: RwLock::new(retained),
            persister,
        }
    }

    /// Store or remove the retained message carried by `packet`: a retained
    /// publish with an empty payload deletes the entry for its topic.
    pub fn store(&self, packet: &PublishPacket) {
        let topic = packet.topic().to_string();
        if packet.message().is_empty() {
            if let Err(err) = self.persister.delete(KEY_BROKER_RETAIN, &topic) {
                log::error!("retain: Failed to delete record for {topic:?}: {err}");
            }
            write_lock(&self.retained).remove(&topic);
            return;
        }

        match serde_json::to_vec(packet) {
            Ok(blob) => {
                if let Err(err) = self.persister.save(KEY_BROKER_RETAIN, &topic, &blob) {
                    log::error!("retain: Failed to persist record for {topic:?}: {err}");
                }
            }
            Err(err) => {
                log::error!("retain: Failed to encode record for {topic:?}: {err}");
            }
        }
        write_lock(&self.retained).insert(topic, packet.clone());
    }

    /// Collect retained messages matching `filter`, QoS clamped to the
    /// filter's maximum, for delivery to a fresh subscription. Copies keep
    /// the retain flag set [MQTT-3.3.1-8].
    pub fn matching(&self, filter: &SubscribeTopic, cache: &FilterCache) -> Vec<PublishPacket> {
        let compiled = match cache.get(filter.topic()) {
            Ok(compiled) => compiled,
            Err(_err) => return Vec::new(),
        };

        let retained = read_lock(&self.retained);
        retained
            .iter()
            .filter(|(topic, _packet)| compiled.is_match(topic))
            .map(|(_topic, packet)| {
                let mut copy = packet.clone();
                if copy.qos() > filter.qos() {
                    copy.set_qos(filter.qos());
                }
                copy
            })
            .collect()
    }
}

/// Compiled topic filters by source string, insert-on-miss.
///
/// Bounded: once `capacity` entries are cached, further filters are compiled
/// per use instead of being cached, so a client cycling through distinct
/// filters cannot grow the map without limit.
pub(crate) struct FilterCache {
    paths: RwLock<HashMap<String, Arc<Topic>>>,
    capacity: usize,
}

impl FilterCache {
    const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self {
            paths: RwLock::new(HashMap::new()),
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    /// Get the compiled form of `filter`, compiling and caching on miss.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` violates the topic filter grammar.
    pub fn get(&self, filter: &str) -> Result<Arc<Topic>, TopicError> {
        if let Some(path) = read_lock(&self.paths).get(filter) {
            return Ok(Arc::clone(path));
        }

        let path = Arc::new(Topic::parse(filter)?);
        let mut paths = write_lock(&self.paths);
        if paths.len() < self.capacity {
            paths.insert(filter.to_string(), Arc::clone(&path));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{PacketId, QoS};
    use session::MemoryPersister;
    use tokio::sync::mpsc;

    fn handle(id: ConnectionId, client_id: &str) -> (ConnectionHandle, mpsc::Receiver<ConnectionCmd>) {
        let (sender, receiver) = mpsc::channel(4);
        let handle = ConnectionHandle {
            id,
            client_id: client_id.to_string(),
            sender,
            session: Arc::new(Session::new()),
        };
        (handle, receiver)
    }

    #[test]
    fn test_add_displaces_previous_holder() {
        let registry = ConnRegistry::new();
        let (first, _rx1) = handle(1, "dev");
        let (second, _rx2) = handle(2, "dev");

        assert!(registry.add(first).is_none());
        let displaced = registry.add(second).unwrap();
        assert_eq!(displaced.id, 1);
        assert_eq!(registry.get("dev").unwrap().id, 2);
    }

    #[test]
    fn test_stale_remove_keeps_successor() {
        let registry = ConnRegistry::new();
        let (first, _rx1) = handle(1, "dev");
        let (second, _rx2) = handle(2, "dev");
        let _ = registry.add(first);
        let _ = registry.add(second);

        // The displaced connection releases late.
        registry.remove("dev", 1);
        assert_eq!(registry.get("dev").unwrap().id, 2);

        registry.remove("dev", 2);
        assert!(registry.get("dev").is_none());
    }

    #[tokio::test]
    async fn test_publish_clamps_qos_and_excludes_publisher() {
        let registry = ConnRegistry::new();
        let cache = FilterCache::new();

        let (subscriber, mut sub_rx) = handle(1, "sub");
        subscriber
            .session
            .set_subscriptions(vec![SubscribeTopic::new("a/+", QoS::AtLeastOnce).unwrap()]);
        let _ = registry.add(subscriber);

        let (publisher, mut pub_rx) = handle(2, "pub");
        publisher
            .session
            .set_subscriptions(vec![SubscribeTopic::new("a/+", QoS::ExactOnce).unwrap()]);
        let _ = registry.add(publisher);

        let mut packet = PublishPacket::new("a/x", QoS::ExactOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::new(5));
        registry.publish(&packet, "pub", &cache).await;

        let ConnectionCmd::Publish(delivered) = sub_rx.try_recv().unwrap() else {
            panic!("expected publish command");
        };
        assert_eq!(delivered.qos(), QoS::AtLeastOnce);
        assert_eq!(delivered.message(), b"hi");
        assert!(pub_rx.try_recv().is_err());
    }

    #[test]
    fn test_retain_registry_store_and_remove() {
        let persister = Arc::new(MemoryPersister::new());
        let registry = RetainRegistry::load(persister.clone());
        let cache = FilterCache::new();

        let mut packet = PublishPacket::new("t/1", QoS::AtLeastOnce, b"state").unwrap();
        packet.set_packet_id(PacketId::new(1));
        packet.set_retain(true);
        registry.store(&packet);

        let filter = SubscribeTopic::new("t/+", QoS::AtMostOnce).unwrap();
        let matches = registry.matching(&filter, &cache);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos(), QoS::AtMostOnce);
        assert_eq!(matches[0].message(), b"state");

        // Survives a reload through the persister.
        let reloaded = RetainRegistry::load(persister.clone());
        assert_eq!(reloaded.matching(&filter, &cache).len(), 1);

        // An empty payload removes the entry, also from the persister.
        let mut tombstone = PublishPacket::new("t/1", QoS::AtMostOnce, b"").unwrap();
        tombstone.set_retain(true);
        registry.store(&tombstone);
        assert!(registry.matching(&filter, &cache).is_empty());
        let reloaded = RetainRegistry::load(persister);
        assert!(reloaded.matching(&filter, &cache).is_empty());
    }

    #[test]
    fn test_filter_cache_rejects_bad_filter() {
        let cache = FilterCache::new();
        assert!(cache.get("sport/#").is_ok());
        assert!(cache.get("sport#").is_err());
        // Cached entry is shared.
        let first = cache.get("sport/#").unwrap();
        let second = cache.get("sport/#").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
