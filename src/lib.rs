//! Kadmesh: a Kademlia-inspired P2P overlay
//!
//! This crate provides the networking substrate for decentralized
//! applications:
//! - Distance-bucketed routing table (256 classes, recency-ordered
//!   k-buckets) over SHA-256 node ids
//! - UDP peer discovery: PING/PONG liveness with NAT address echo,
//!   FINDNODE neighbor harvesting, anti-spoof reply correlation, and
//!   timeout-driven eviction
//! - Pooled TCP transport with a gzip+JSON wire codec and transparent
//!   multipart chunking for large messages
//! - An ordered middleware pipeline that applications plug their
//!   protocols into, with bucket-wide broadcast helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use kadmesh::config::OverlayConfig;
//! use kadmesh::identity::NodeId;
//! use kadmesh::overlay::Overlay;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let id = NodeId::from_public_key(b"my public key bytes");
//! let mut overlay = Overlay::new(id, "0.0.0.0".parse()?, OverlayConfig::default())?;
//! overlay.start().await?;
//!
//! let status = overlay.status().await?;
//! println!("node {} knows {} peers", status.node_id, status.peer_count);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod identity;
pub mod message;
pub mod middleware;
pub mod overlay;
pub mod routing;
pub mod transport;

// Re-export commonly used types
pub use config::{BootstrapList, OverlayConfig};
pub use identity::{LocalNode, NodeId, RemoteNode};
pub use message::{ChunkEnvelope, DiscoveryPayload, Envelope, UdpEnvelope};
pub use middleware::{Flow, Middleware, NetContext, P2pContext, Pipeline};
pub use overlay::{Overlay, OverlayStatus};
pub use routing::{RoutingTable, BUCKET_SIZE};
pub use transport::{Transport, TransportError};
