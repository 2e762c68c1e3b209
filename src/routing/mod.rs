//! Distance-bucketed routing table
//!
//! Peers are clustered by a coarse distance class (the leading byte of
//! the XOR of two ids, 256 classes) into capacity-bounded, recency-ordered
//! k-buckets. All mutation happens under a single table-wide lock held by
//! the owner (the table itself is a plain synchronous structure).

pub mod bucket;
pub mod table;

pub use bucket::{KBucket, BUCKET_SIZE};
pub use table::RoutingTable;
