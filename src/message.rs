//! Wire envelope types
//!
//! Every message on the wire is JSON with camelCase field names. Three
//! envelope shapes exist: the logical TCP envelope ([`Envelope`]), the
//! multipart chunk wrapper ([`ChunkEnvelope`]) carrying a slice of a
//! logical message, and the UDP discovery envelope ([`UdpEnvelope`]) whose
//! payload is a closed enum so new discovery message types are a
//! compile-time-checked addition.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Seconds after which a discovery datagram is considered stale.
pub const DEFAULT_EXPIRE_SECS: i64 = 5;

/// Category routing discovery traffic.
pub const DISCOVERY_CATEGORY: &str = "discovery";

/// Base fields shared by every logical message.
///
/// `category` routes to a registered middleware; `kind` selects behavior
/// within it. Application middlewares embed these fields (via
/// `#[serde(flatten)]`) in their own message structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub node_id: NodeId,
    pub timestamp: i64,
    pub category: String,
    /// Behavior selector within the category; `type` on the wire, same
    /// as the discovery envelope's tag.
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
}

impl Envelope {
    pub fn new(node_id: NodeId, category: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            timestamp: chrono::Utc::now().timestamp(),
            category: category.into(),
            kind: kind.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// One fragment of a logical message.
///
/// All chunks of one logical message share the envelope `id`. A message
/// that fits in a single chunk degenerates to `chunks_count == 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    #[serde(flatten)]
    pub head: Envelope,
    /// Index of this chunk within the logical message.
    pub chunk_no: u32,
    /// Total number of chunks.
    pub chunks_count: u32,
    /// Byte length of `raw_data`.
    pub chunk_size: u32,
    /// Byte length of the whole logical message.
    pub chunk_total_size: u64,
    pub raw_data: Vec<u8>,
}

/// Record describing a peer in a FINDNODERESP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

/// Discovery message body, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DiscoveryPayload {
    #[serde(rename = "PING")]
    Ping,
    /// Echo of a PING, carrying the sender's address as observed by the
    /// responder so the requester learns its externally visible address.
    #[serde(rename = "PONG", rename_all = "camelCase")]
    Pong { remote_addr: IpAddr, remote_port: u16 },
    #[serde(rename = "FINDNODE")]
    FindNode,
    #[serde(rename = "FINDNODERESP")]
    FindNodeResp { nodes: Vec<NodeRecord> },
}

impl DiscoveryPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            DiscoveryPayload::Ping => "PING",
            DiscoveryPayload::Pong { .. } => "PONG",
            DiscoveryPayload::FindNode => "FINDNODE",
            DiscoveryPayload::FindNodeResp { .. } => "FINDNODERESP",
        }
    }

    /// Is this a reply that correlates to a pending request?
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            DiscoveryPayload::Pong { .. } | DiscoveryPayload::FindNodeResp { .. }
        )
    }
}

/// UDP discovery envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpEnvelope {
    pub id: Uuid,
    pub node_id: NodeId,
    pub timestamp: i64,
    pub category: String,
    pub version: u32,
    /// Staleness window in seconds.
    pub expire: i64,
    /// Sender's intranet address hint.
    pub local_addr: IpAddr,
    pub local_port: u16,
    #[serde(flatten)]
    pub payload: DiscoveryPayload,
}

impl UdpEnvelope {
    pub fn new(node_id: NodeId, local_addr: IpAddr, local_port: u16, payload: DiscoveryPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            timestamp: chrono::Utc::now().timestamp(),
            category: DISCOVERY_CATEGORY.to_string(),
            version: PROTOCOL_VERSION,
            expire: DEFAULT_EXPIRE_SECS,
            local_addr,
            local_port,
            payload,
        }
    }

    /// Build a reply reusing the request's message id (the correlation
    /// key the requester's waitlist is keyed by).
    pub fn reply_to(
        request_id: Uuid,
        node_id: NodeId,
        local_addr: IpAddr,
        local_port: u16,
        payload: DiscoveryPayload,
    ) -> Self {
        let mut envelope = Self::new(node_id, local_addr, local_port, payload);
        envelope.id = request_id;
        envelope
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.timestamp > self.expire
    }
}
