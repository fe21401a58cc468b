// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use codec::{PacketId, PublishPacket, SubscribeTopic};

use crate::{PersistError, Persister};

/// Wire shape of the persisted session blob:
///
/// ```json
/// {
///   "PubOut": { "7": { ...publish... } },
///   "PubIn": { "3": true },
///   "Subscript": [ { "Topic": "a/+", "Qos": 1 } ]
/// }
/// ```
///
/// Every sub-structure is defaulted so a partial or legacy blob normalises
/// to empty containers instead of failing the load.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionRecord {
    /// Outbound QoS 1/2 publishes that have not been completely
    /// acknowledged, keyed by packet id. Ordered, so resumption re-sends
    /// in admission order.
    #[serde(rename = "PubOut", default)]
    pub_out: BTreeMap<u16, PublishPacket>,

    /// Packet ids of inbound QoS 2 publishes acknowledged with PUBREC but
    /// not yet released by PUBREL.
    #[serde(rename = "PubIn", default, with = "pub_in_flags")]
    pub_in: HashSet<u16>,

    /// The client's subscriptions, in subscribe order, unique by filter.
    #[serde(rename = "Subscript", default)]
    subscriptions: Vec<SubscribeTopic>,
}

/// `PubIn` is stored as a `{pid: true}` object rather than an array.
mod pub_in_flags {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, HashSet};

    pub fn serialize<S: Serializer>(set: &HashSet<u16>, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<u16, bool> = set.iter().map(|pid| (*pid, true)).collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashSet<u16>, D::Error> {
        let map = BTreeMap::<u16, bool>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .filter_map(|(pid, flag)| flag.then_some(pid))
            .collect())
    }
}

/// A stateful interaction between a client and a broker.
///
/// Some sessions last only as long as the network connection, others span
/// multiple consecutive network connections between a client and a broker.
/// Both sides keep one `Session` per client id; all mutation goes through
/// the internal lock so connection tasks and registries can share it.
#[derive(Debug, Default)]
pub struct Session {
    inner: RwLock<SessionRecord>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionRecord> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionRecord> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Park an outbound publish until the peer acknowledges it.
    pub fn add_pub_out(&self, packet_id: PacketId, packet: PublishPacket) {
        self.write().pub_out.insert(packet_id.value(), packet);
    }

    /// Drop an outbound publish, after PUBACK (QoS 1) or PUBREC (QoS 2).
    pub fn remove_pub_out(&self, packet_id: PacketId) {
        self.write().pub_out.remove(&packet_id.value());
    }

    /// Whether an outbound publish with `packet_id` is still parked.
    #[must_use]
    pub fn has_pub_out(&self, packet_id: PacketId) -> bool {
        self.read().pub_out.contains_key(&packet_id.value())
    }

    /// Return all parked outbound publishes, ordered by packet id, and clear
    /// the set. Used on reconnect to re-send unacknowledged messages.
    #[must_use]
    pub fn reset_pub_out(&self) -> Vec<(PacketId, PublishPacket)> {
        let pub_out = std::mem::take(&mut self.write().pub_out);
        pub_out
            .into_iter()
            .map(|(pid, packet)| (PacketId::new(pid), packet))
            .collect()
    }

    /// Record an inbound QoS 2 publish until PUBREL releases it.
    pub fn add_pub_in(&self, packet_id: PacketId) {
        self.write().pub_in.insert(packet_id.value());
    }

    /// Whether an inbound QoS 2 publish with `packet_id` is recorded.
    #[must_use]
    pub fn has_pub_in(&self, packet_id: PacketId) -> bool {
        self.read().pub_in.contains(&packet_id.value())
    }

    /// Release an inbound QoS 2 publish.
    pub fn remove_pub_in(&self, packet_id: PacketId) {
        self.write().pub_in.remove(&packet_id.value());
    }

    /// Replace the subscription list. The caller is responsible for the
    /// uniqueness of filters in `subscriptions`.
    pub fn set_subscriptions(&self, subscriptions: Vec<SubscribeTopic>) {
        self.write().subscriptions = subscriptions;
    }

    /// Append subscriptions to the list. The caller must have checked the
    /// new filters against the existing list.
    pub fn append_subscriptions(&self, subscriptions: &[SubscribeTopic]) {
        self.write().subscriptions.extend_from_slice(subscriptions);
    }

    /// Remove every subscription whose filter string appears in `filters`.
    pub fn remove_subscriptions(&self, filters: &[String]) {
        if filters.is_empty() {
            return;
        }
        self.write()
            .subscriptions
            .retain(|sub| !filters.iter().any(|filter| filter == sub.topic()));
    }

    /// Get a copy of the subscription list.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscribeTopic> {
        self.read().subscriptions.clone()
    }

    /// Serialise this session into its persisted JSON form.
    ///
    /// # Errors
    ///
    /// Returns error if serialisation fails.
    pub fn to_blob(&self) -> Result<Vec<u8>, PersistError> {
        Ok(serde_json::to_vec(&*self.read())?)
    }

    /// Serialise and write this session under `(key, client_id)`.
    ///
    /// # Errors
    ///
    /// Returns error if serialisation or the persister fails.
    pub fn save(
        &self,
        key: &str,
        client_id: &str,
        persister: &dyn Persister,
    ) -> Result<(), PersistError> {
        let blob = self.to_blob()?;
        persister.save(key, client_id, &blob)
    }

    /// Parse a persisted session blob. Missing sub-structures normalise to
    /// empty containers.
    ///
    /// # Errors
    ///
    /// Returns error if `blob` is not a valid session record.
    pub fn from_blob(blob: &[u8]) -> Result<Self, PersistError> {
        let record: SessionRecord = serde_json::from_slice(blob)?;
        Ok(Self {
            inner: RwLock::new(record),
        })
    }
}
