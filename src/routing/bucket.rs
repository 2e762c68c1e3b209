//! Recency-ordered k-bucket.

use crate::identity::{NodeId, RemoteNode};
use std::collections::VecDeque;

/// Capacity of a single bucket (K).
pub const BUCKET_SIZE: usize = 8;

/// Bounded, recency-ordered collection of peers sharing one distance
/// class. Head is the least-recently-confirmed entry (the eviction
/// candidate swept by liveness pings), tail the most recent.
#[derive(Debug, Default, Clone)]
pub struct KBucket {
    nodes: VecDeque<RemoteNode>,
}

impl KBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Least-recently-confirmed entry.
    pub fn peek(&self) -> Option<&RemoteNode> {
        self.nodes.front()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == *id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut RemoteNode> {
        self.nodes.iter_mut().find(|n| n.id == *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteNode> {
        self.nodes.iter()
    }

    /// Append a node at the tail. Rejected (returns false) when the
    /// bucket is full or the id is already present.
    pub fn push(&mut self, node: RemoteNode) -> bool {
        if self.nodes.len() >= BUCKET_SIZE || self.contains(&node.id) {
            return false;
        }
        self.nodes.push_back(node);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<RemoteNode> {
        let pos = self.nodes.iter().position(|n| n.id == *id)?;
        self.nodes.remove(pos)
    }

    /// Recency bump: move an existing member to the tail.
    pub fn move_to_tail(&mut self, id: &NodeId) -> bool {
        match self.nodes.iter().position(|n| n.id == *id) {
            Some(pos) => {
                if let Some(node) = self.nodes.remove(pos) {
                    self.nodes.push_back(node);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    fn node(tag: u8) -> RemoteNode {
        RemoteNode::new(
            NodeId::from_public_key(&[tag]),
            format!("10.0.0.{}:9000", tag).parse().unwrap(),
            format!("203.0.113.{}:9000", tag).parse().unwrap(),
        )
    }

    #[test]
    fn test_capacity_enforced() {
        let mut bucket = KBucket::new();
        for i in 0..BUCKET_SIZE as u8 {
            assert!(bucket.push(node(i)));
        }
        assert!(!bucket.push(node(200)));
        assert_eq!(bucket.len(), BUCKET_SIZE);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut bucket = KBucket::new();
        assert!(bucket.push(node(1)));
        assert!(!bucket.push(node(1)));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_move_to_tail() {
        let mut bucket = KBucket::new();
        let first = node(1);
        let first_id = first.id;
        bucket.push(first);
        bucket.push(node(2));
        bucket.push(node(3));

        assert_eq!(bucket.peek().unwrap().id, first_id);
        assert!(bucket.move_to_tail(&first_id));
        assert_ne!(bucket.peek().unwrap().id, first_id);
        assert_eq!(bucket.nodes.back().unwrap().id, first_id);
    }

    #[test]
    fn test_remove() {
        let mut bucket = KBucket::new();
        let n = node(1);
        let id = n.id;
        bucket.push(n);
        assert!(bucket.remove(&id).is_some());
        assert!(bucket.remove(&id).is_none());
        assert!(bucket.is_empty());
    }
}
