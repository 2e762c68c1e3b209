//! Pending-request bookkeeping for the discovery protocol.
//!
//! Every outbound PING or FINDNODE registers here under its message id.
//! A reply echoing that id either confirms the peer (the claimed sender
//! matches who we asked) or exposes an address takeover (it does not),
//! in which case the peer we *thought* lived at that address is evicted
//! by the caller. Unanswered entries are reaped on a deadline.

use crate::identity::NodeId;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One outstanding request.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Peer the request was addressed to.
    pub expect: NodeId,
    pub sent_at: Instant,
    pub expires_at: Instant,
}

/// Verdict for an inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The expected peer answered; round-trip time attached.
    Confirmed { latency: Duration },
    /// A different node answered from the expected peer's address.
    Mismatch { expected: NodeId },
    /// No pending request carries this id (stale, duplicate, or forged).
    Unknown,
}

/// Outstanding discovery requests, keyed by message id.
#[derive(Debug, Default)]
pub struct Waitlist {
    pending: DashMap<Uuid, Pending>,
}

impl Waitlist {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Record an outbound request expecting an answer from `expect`
    /// within `timeout`.
    pub fn register(&self, id: Uuid, expect: NodeId, timeout: Duration) {
        let now = Instant::now();
        self.pending.insert(
            id,
            Pending {
                expect,
                sent_at: now,
                expires_at: now + timeout,
            },
        );
    }

    /// Match an inbound reply against the waitlist. The pending entry is
    /// consumed either way; a reply id gets exactly one verdict.
    pub fn observe(&self, id: &Uuid, from: &NodeId) -> Reply {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                if entry.expect == *from {
                    Reply::Confirmed {
                        latency: entry.sent_at.elapsed(),
                    }
                } else {
                    Reply::Mismatch {
                        expected: entry.expect,
                    }
                }
            }
            None => Reply::Unknown,
        }
    }

    /// Drop expired entries, returning the peers that never answered.
    pub fn reap(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut silent = Vec::new();
        self.pending.retain(|_, entry| {
            if entry.expires_at <= now {
                silent.push(entry.expect);
                false
            } else {
                true
            }
        });
        silent
    }

    /// Earliest expiry among pending entries, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|entry| entry.expires_at)
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: &[u8]) -> NodeId {
        NodeId::from_public_key(tag)
    }

    #[test]
    fn test_confirmed_reply_consumes_entry() {
        let waitlist = Waitlist::new();
        let msg = Uuid::new_v4();
        let peer = id(b"peer");
        waitlist.register(msg, peer, Duration::from_secs(3));

        match waitlist.observe(&msg, &peer) {
            Reply::Confirmed { latency } => assert!(latency < Duration::from_secs(1)),
            other => panic!("expected confirmation, got {:?}", other),
        }
        // Second reply with the same id is unknown
        assert_eq!(waitlist.observe(&msg, &peer), Reply::Unknown);
    }

    #[test]
    fn test_mismatch_names_expected_peer() {
        let waitlist = Waitlist::new();
        let msg = Uuid::new_v4();
        let expected = id(b"expected");
        let imposter = id(b"imposter");
        waitlist.register(msg, expected, Duration::from_secs(3));

        assert_eq!(
            waitlist.observe(&msg, &imposter),
            Reply::Mismatch { expected }
        );
        assert!(waitlist.is_empty());
    }

    #[test]
    fn test_unsolicited_reply_is_unknown() {
        let waitlist = Waitlist::new();
        assert_eq!(waitlist.observe(&Uuid::new_v4(), &id(b"anyone")), Reply::Unknown);
    }

    #[test]
    fn test_reap_returns_silent_peers() {
        let waitlist = Waitlist::new();
        let silent = id(b"silent");
        let fresh = id(b"fresh");
        waitlist.register(Uuid::new_v4(), silent, Duration::ZERO);
        waitlist.register(Uuid::new_v4(), fresh, Duration::from_secs(30));

        std::thread::sleep(Duration::from_millis(5));
        let reaped = waitlist.reap();
        assert_eq!(reaped, vec![silent]);
        assert_eq!(waitlist.len(), 1);
    }

    #[test]
    fn test_next_deadline_tracks_earliest() {
        let waitlist = Waitlist::new();
        assert!(waitlist.next_deadline().is_none());

        waitlist.register(Uuid::new_v4(), id(b"far"), Duration::from_secs(30));
        waitlist.register(Uuid::new_v4(), id(b"near"), Duration::from_secs(1));
        let deadline = waitlist.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(1));
    }
}
