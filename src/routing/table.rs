//! The routing table proper.

use crate::config::BootstrapList;
use crate::identity::{NodeId, RemoteNode};
use crate::routing::bucket::KBucket;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Mapping from distance class (0-255) to k-bucket.
///
/// The class of every contained node equals the key of the bucket holding
/// it, and the local id is never stored. Callers wrap the table in a
/// single `RwLock`; nothing here synchronizes on its own.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Total number of known peers.
    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|b| b.is_empty())
    }

    /// Add or refresh a peer.
    ///
    /// An existing member has its addresses and latency updated and is
    /// moved to the bucket tail. A new peer is appended if its bucket has
    /// room; when the bucket is full the add is rejected and `false`
    /// returned. (Probing the bucket head and evicting it if dead before
    /// admitting the newcomer is a known, deliberately unimplemented
    /// policy.)
    pub fn refresh(
        &mut self,
        id: NodeId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        latency_ms: Option<u64>,
    ) -> bool {
        if id == self.local_id {
            return false;
        }
        let class = self.local_id.distance_class(&id);
        let bucket = self.buckets.entry(class).or_default();

        if let Some(existing) = bucket.get_mut(&id) {
            existing.addrs.local_addr = local_addr;
            existing.addrs.remote_addr = remote_addr;
            if latency_ms.is_some() {
                existing.latency_ms = latency_ms;
            }
            bucket.move_to_tail(&id);
            return true;
        }

        let mut node = RemoteNode::new(id, local_addr, remote_addr);
        node.distance = Some(class);
        node.latency_ms = latency_ms;
        let added = bucket.push(node);
        if !added {
            log::debug!("bucket {} full, rejecting peer {}", class, id);
        }
        added
    }

    /// Insert a pre-built record (bootstrap seeding). Same bucket rules
    /// as [`refresh`](Self::refresh).
    pub fn insert(&mut self, mut node: RemoteNode) -> bool {
        if node.id == self.local_id {
            return false;
        }
        let class = self.local_id.distance_class(&node.id);
        node.distance = Some(class);
        let bucket = self.buckets.entry(class).or_default();
        if bucket.contains(&node.id) {
            return bucket.move_to_tail(&node.id);
        }
        bucket.push(node)
    }

    /// Remove a peer ("offline"). No-op if absent.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let class = self.local_id.distance_class(id);
        match self.buckets.get_mut(&class) {
            Some(bucket) => bucket.remove(id).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let class = self.local_id.distance_class(id);
        self.buckets
            .get(&class)
            .map(|b| b.contains(id))
            .unwrap_or(false)
    }

    /// One representative per non-empty bucket: the head, i.e. the
    /// least-recently-confirmed entry. This is the population swept by
    /// periodic liveness pings.
    pub fn peek(&self) -> Vec<RemoteNode> {
        self.buckets
            .values()
            .filter_map(|b| b.peek().cloned())
            .collect()
    }

    /// All known peers sorted by true pairwise XOR distance from the
    /// local id, ascending, truncated to `max`.
    pub fn get_nearby(&self, max: usize) -> Vec<RemoteNode> {
        let mut all: Vec<RemoteNode> = self
            .buckets
            .values()
            .flat_map(|b| b.iter().cloned())
            .collect();
        all.sort_by_key(|n| self.local_id.xor(&n.id));
        all.truncate(max);
        all
    }

    /// Up to `k` peers near `target`: start at the target's own distance
    /// class and expand alternately to lower and higher classes until `k`
    /// entries are gathered or the 0..=255 range is exhausted.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<RemoteNode> {
        let mut found = Vec::with_capacity(k);
        let center = self.local_id.distance_class(target) as i32;

        let collect = |class: i32, found: &mut Vec<RemoteNode>| {
            if !(0..=255).contains(&class) {
                return;
            }
            if let Some(bucket) = self.buckets.get(&(class as u8)) {
                for node in bucket.iter() {
                    if found.len() >= k {
                        break;
                    }
                    if node.id != *target {
                        found.push(node.clone());
                    }
                }
            }
        };

        collect(center, &mut found);
        let mut step = 1;
        while found.len() < k && (center - step >= 0 || center + step <= 255) {
            collect(center - step, &mut found);
            if found.len() >= k {
                break;
            }
            collect(center + step, &mut found);
            step += 1;
        }
        found
    }

    /// Seed the table from the bootstrap peer list. Invoked at
    /// construction and again by the ping sweep whenever the table runs
    /// empty.
    pub fn seed(&mut self, list: &BootstrapList) -> usize {
        let mut added = 0;
        for peer in &list.nodes {
            let addr = SocketAddr::new(peer.ip, peer.port);
            let node = RemoteNode::new(peer.id, addr, addr);
            if self.insert(node) {
                added += 1;
            }
        }
        if added > 0 {
            log::info!("seeded {} bootstrap peers", added);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NODE_ID_LEN;
    use crate::routing::BUCKET_SIZE;

    fn raw_id(bytes: &[u8]) -> NodeId {
        let mut full = [0u8; NODE_ID_LEN];
        full[..bytes.len()].copy_from_slice(bytes);
        NodeId::from_hex(&hex::encode(full)).unwrap()
    }

    fn addr(tag: u8) -> SocketAddr {
        format!("203.0.113.{}:32768", tag).parse().unwrap()
    }

    fn table() -> RoutingTable {
        RoutingTable::new(raw_id(&[0]))
    }

    #[test]
    fn test_self_never_added() {
        let mut t = table();
        let me = t.local_id();
        assert!(!t.refresh(me, addr(1), addr(1), None));
        assert!(t.is_empty());
        assert!(t.peek().is_empty());
    }

    #[test]
    fn test_refresh_adds_and_bumps() {
        let mut t = table();
        // Same class (5), distinct ids via the second byte
        let a = raw_id(&[5, 1]);
        let b = raw_id(&[5, 2]);
        assert!(t.refresh(a, addr(1), addr(1), None));
        assert!(t.refresh(b, addr(2), addr(2), None));

        // Head is the least recently confirmed
        assert_eq!(t.peek()[0].id, a);

        // Refreshing `a` moves it to the tail, leaving `b` as head
        assert!(t.refresh(a, addr(1), addr(1), Some(12)));
        assert_eq!(t.peek()[0].id, b);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_bucket_full_rejects() {
        let mut t = table();
        for i in 0..BUCKET_SIZE as u8 {
            assert!(t.refresh(raw_id(&[5, i]), addr(i), addr(i), None));
        }
        assert!(!t.refresh(raw_id(&[5, 99]), addr(99), addr(99), None));
        assert_eq!(t.len(), BUCKET_SIZE);
        // Existing members can still be refreshed
        assert!(t.refresh(raw_id(&[5, 0]), addr(0), addr(0), None));
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let mut t = table();
        let id = raw_id(&[9, 1]);
        assert!(!t.remove(&id));
        t.refresh(id, addr(1), addr(1), None);
        assert!(t.remove(&id));
        assert!(!t.contains(&id));
    }

    #[test]
    fn test_distance_field_matches_bucket_key() {
        let mut t = table();
        let id = raw_id(&[0x42, 1]);
        t.refresh(id, addr(1), addr(1), None);
        let stored = &t.peek()[0];
        assert_eq!(stored.distance, Some(0x42));
    }

    #[test]
    fn test_get_nearby_sorted_by_full_distance() {
        let mut t = table();
        // Same leading byte, so ordering must use deeper bytes
        let near = raw_id(&[1, 1]);
        let far = raw_id(&[1, 0xff]);
        t.refresh(far, addr(2), addr(2), None);
        t.refresh(near, addr(1), addr(1), None);

        let nearby = t.get_nearby(10);
        assert_eq!(nearby[0].id, near);
        assert_eq!(nearby[1].id, far);

        assert_eq!(t.get_nearby(1).len(), 1);
    }

    #[test]
    fn test_find_closest_expands_outward() {
        let mut t = table();
        // Peers in classes {3, 5, 5, 7}, target in class 5
        let in3 = raw_id(&[3, 1]);
        let in5a = raw_id(&[5, 1]);
        let in5b = raw_id(&[5, 2]);
        let in7 = raw_id(&[7, 1]);
        for id in [in3, in5a, in5b, in7] {
            t.refresh(id, addr(1), addr(1), None);
        }

        let target = raw_id(&[5, 99]);
        let found = t.find_closest(&target, 8);
        assert_eq!(found.len(), 4);
        // Class 5 first, then the alternating expansion reaches 3 before 7
        assert!(found[..2].iter().all(|n| n.distance == Some(5)));
        assert_eq!(found[0].id, in5a);
        assert_eq!(found[2].id, in3);
        assert_eq!(found[3].id, in7);
    }

    #[test]
    fn test_find_closest_respects_k() {
        let mut t = table();
        for i in 0..6u8 {
            t.refresh(raw_id(&[5, i]), addr(i), addr(i), None);
        }
        assert_eq!(t.find_closest(&raw_id(&[5, 200]), 3).len(), 3);
    }

    #[test]
    fn test_find_closest_excludes_target_itself() {
        let mut t = table();
        let target = raw_id(&[5, 1]);
        t.refresh(target, addr(1), addr(1), None);
        assert!(t.find_closest(&target, 8).is_empty());
    }
}
