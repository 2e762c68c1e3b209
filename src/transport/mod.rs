//! Connection-pooled TCP transport
//!
//! One long-lived connection per peer address, created lazily on first
//! send and torn down on I/O failure. Every frame on the wire is a
//! gzip-compressed JSON [`ChunkEnvelope`](crate::message::ChunkEnvelope);
//! logical messages larger than the configured chunk size are split and
//! reassembled by index on the receiving side.

pub mod codec;
pub mod multipart;
pub mod pool;

pub use codec::{decode_datagram, encode_datagram, WireCodec, MAGIC, MAX_FRAME_SIZE};
pub use multipart::{split_into_chunks, Reassembler, SuppressionCache, MAX_MESSAGE_SIZE};
pub use pool::{ConnectionEvent, ConnectionInfo, Dialer, PeerStream, TcpDialer, Transport};

use thiserror::Error;

/// Transport-level errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid magic bytes")]
    BadMagic,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed chunk: {0}")]
    MalformedChunk(&'static str),
    /// The message id was recently broadcast by this node; the looped-back
    /// copy is rejected, distinct from any delivery failure.
    #[error("rejected own broadcast loopback")]
    SelfBroadcast,
    #[error("connection closed")]
    ConnectionClosed,
}
