//! Peer discovery over UDP
//!
//! Keeps the routing table populated and fresh: periodic liveness pings
//! against one representative per bucket, neighbor harvesting via
//! FINDNODE, reply correlation through a pending-request waitlist, and
//! timeout-driven eviction of silent peers.

mod protocol;
mod waitlist;

pub use protocol::DiscoveryService;
pub use waitlist::{Pending, Reply, Waitlist};
