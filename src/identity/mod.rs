//! Node identity types
//!
//! Every peer is identified by a fixed-length [`NodeId`] derived from its
//! public key. Key generation and persistence belong to the embedding
//! application; this module only consumes the derived identity.

mod node;

pub use node::{LocalNode, Node, RemoteNode};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a node identifier in bytes (SHA-256 digest).
pub const NODE_ID_LEN: usize = 32;

/// Errors from parsing a node identifier.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid id length: expected {NODE_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Fixed-length peer identifier.
///
/// The id is the SHA-256 digest of the peer's uncompressed public key
/// point. It is rendered as a lowercase hex string on the wire, in logs,
/// and as map keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive an id from an uncompressed public key point.
    pub fn from_public_key(point: &[u8]) -> Self {
        let digest = Sha256::digest(point);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest);
        NodeId(id)
    }

    /// Parse an id from its hex rendering.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(IdentityError::InvalidLength(bytes.len()));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(NodeId(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn xor(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Coarse distance class: the leading byte of the XOR of the two ids.
    ///
    /// This bounds the table to 256 buckets regardless of id length and is
    /// an intentional divergence from bit-trie Kademlia, preserved for
    /// wire and bootstrap compatibility. Deterministic for a given pair.
    pub fn distance_class(&self, other: &NodeId) -> u8 {
        self.0[0] ^ other.0[0]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable
        write!(f, "NodeId({}..)", &hex::encode(self.0)[..8])
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

struct NodeIdVisitor;

impl Visitor<'_> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {}-character hex string", NODE_ID_LEN * 2)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
        NodeId::from_hex(v).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(NodeIdVisitor)
    }
}
