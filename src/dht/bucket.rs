/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::net::SocketAddr;

use smol::lock::Mutex;

use super::node_id::{NodeId, NODE_ID_BITS};
use crate::util::time::Timestamp;

/// Max contacts per bucket
pub const K: usize = 20;

/// A peer known to the routing table. Lives in exactly one bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtContact {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Timestamp,
}

impl DhtContact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr, last_seen: Timestamp::current_time() }
    }
}

/// Outcome of inserting a contact into its bucket.
#[derive(Debug)]
pub enum BucketInsert {
    /// Contact was present; moved to the tail and refreshed
    Updated,
    /// Contact appended, bucket had room
    Added,
    /// Bucket full. The head (least recently seen) is the eviction
    /// candidate; the caller probes it before deciding.
    Full { candidate: DhtContact },
}

/// Ordered contact list, least recently seen at the head.
pub struct KBucket {
    contacts: Vec<DhtContact>,
    pub last_refresh: Timestamp,
}

impl KBucket {
    fn new() -> Self {
        Self { contacts: Vec::new(), last_refresh: Timestamp::current_time() }
    }

    pub fn insert(&mut self, contact: DhtContact) -> BucketInsert {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return BucketInsert::Updated
        }

        if self.contacts.len() < K {
            self.contacts.push(contact);
            return BucketInsert::Added
        }

        BucketInsert::Full { candidate: self.contacts[0].clone() }
    }

    /// The probed head answered: move it to the tail, the newcomer is
    /// dropped.
    pub fn promote_head(&mut self, id: &NodeId) {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            let mut contact = self.contacts.remove(pos);
            contact.last_seen = Timestamp::current_time();
            self.contacts.push(contact);
        }
    }

    /// The probed head is dead: evict it and append the newcomer.
    pub fn evict_and_insert(&mut self, dead: &NodeId, newcomer: DhtContact) {
        self.contacts.retain(|c| c.id != *dead);
        if self.contacts.len() < K {
            self.contacts.push(newcomer);
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        self.contacts.retain(|c| c.id != *id);
    }

    pub fn contacts(&self) -> &[DhtContact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// The 160-bucket routing table. One lock per bucket; a contact's
/// bucket index is a pure function of its ID, so no ID can appear in
/// two buckets.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..NODE_ID_BITS).map(|_| Mutex::new(KBucket::new())).collect();
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_of(&self, id: &NodeId) -> Option<&Mutex<KBucket>> {
        self.local_id.bucket_index(id).map(|i| &self.buckets[i])
    }

    /// Record traffic from a contact. Returns the eviction candidate
    /// when its bucket is full; the caller pings the candidate and then
    /// calls [`Self::confirm_alive`] or [`Self::confirm_dead`].
    pub async fn update(&self, contact: DhtContact) -> Option<DhtContact> {
        let bucket = self.bucket_of(&contact.id)?;
        match bucket.lock().await.insert(contact) {
            BucketInsert::Full { candidate } => Some(candidate),
            _ => None,
        }
    }

    pub async fn confirm_alive(&self, id: &NodeId) {
        if let Some(bucket) = self.bucket_of(id) {
            bucket.lock().await.promote_head(id);
        }
    }

    pub async fn confirm_dead(&self, dead: &NodeId, newcomer: DhtContact) {
        if let Some(bucket) = self.bucket_of(dead) {
            bucket.lock().await.evict_and_insert(dead, newcomer);
        }
    }

    pub async fn remove(&self, id: &NodeId) {
        if let Some(bucket) = self.bucket_of(id) {
            bucket.lock().await.remove(id);
        }
    }

    /// Up to `count` known contacts closest to `target` by XOR metric.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtContact> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend_from_slice(bucket.lock().await.contacts());
        }

        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    pub async fn contact_count(&self) -> usize {
        let mut count = 0;
        for bucket in &self.buckets {
            count += bucket.lock().await.len();
        }
        count
    }

    /// Indices of buckets whose last refresh is older than `max_age_ms`
    /// and which hold at least one contact.
    pub async fn stale_buckets(&self, max_age_ms: u64) -> Vec<usize> {
        let mut stale = Vec::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock().await;
            if !bucket.is_empty() && bucket.last_refresh.elapsed() > max_age_ms {
                stale.push(i);
            }
        }
        stale
    }

    pub async fn mark_refreshed(&self, index: usize) {
        self.buckets[index].lock().await.last_refresh = Timestamp::current_time();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(byte: u8) -> DhtContact {
        let mut id = [0u8; super::super::node_id::NODE_ID_SIZE];
        // Spread IDs across one bucket by fixing the top bit.
        id[0] = 0x80;
        id[19] = byte;
        DhtContact::new(NodeId(id), format!("127.0.0.1:{}", 9000 + byte as u16).parse().unwrap())
    }

    #[test]
    fn bucket_caps_at_k_and_returns_oldest_candidate() {
        let mut bucket = KBucket::new();

        let first = contact(1);
        assert!(matches!(bucket.insert(first.clone()), BucketInsert::Added));
        for i in 2..=K as u8 {
            assert!(matches!(bucket.insert(contact(i)), BucketInsert::Added));
        }
        assert_eq!(bucket.len(), K);

        // 21st insert: bucket is full, first-inserted is the candidate.
        match bucket.insert(contact(K as u8 + 1)) {
            BucketInsert::Full { candidate } => assert_eq!(candidate.id, first.id),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(bucket.len(), K);
    }

    #[test]
    fn reinsert_moves_to_tail() {
        let mut bucket = KBucket::new();
        for i in 1..=3u8 {
            bucket.insert(contact(i));
        }

        assert!(matches!(bucket.insert(contact(1)), BucketInsert::Updated));
        assert_eq!(bucket.contacts().last().unwrap().id, contact(1).id);
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn eviction_replaces_dead_head() {
        let mut bucket = KBucket::new();
        for i in 1..=K as u8 {
            bucket.insert(contact(i));
        }

        let newcomer = contact(K as u8 + 1);
        bucket.evict_and_insert(&contact(1).id, newcomer.clone());

        assert_eq!(bucket.len(), K);
        assert!(!bucket.contacts().iter().any(|c| c.id == contact(1).id));
        assert_eq!(bucket.contacts().last().unwrap().id, newcomer.id);
    }

    #[test]
    fn closest_orders_by_xor_distance() {
        smol::block_on(async {
            let local = NodeId([0u8; 20]);
            let table = RoutingTable::new(local);

            for i in 1..=10u8 {
                table.update(contact(i)).await;
            }

            let mut target_id = [0u8; 20];
            target_id[0] = 0x80;
            target_id[19] = 3;
            let target = NodeId(target_id);

            let closest = table.closest(&target, 3).await;
            assert_eq!(closest.len(), 3);
            assert_eq!(closest[0].id, contact(3).id);
        });
    }
}
