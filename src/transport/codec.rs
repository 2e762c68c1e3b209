//! Wire codec: length-prefixed framing around gzip-compressed JSON.

use crate::message::ChunkEnvelope;
use crate::transport::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio_util::codec::{Decoder, Encoder};

/// Magic bytes for message framing.
pub const MAGIC: [u8; 4] = *b"KADM";

/// Upper bound on a single frame's compressed payload.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Gzip-compress a byte slice.
pub fn zip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Reverse of [`zip`].
pub fn unzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize and compress an unframed datagram (the UDP path).
pub fn encode_datagram<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    Ok(zip(&serde_json::to_vec(msg)?)?)
}

/// Decompress and parse an unframed datagram.
pub fn decode_datagram<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(&unzip(data)?)?)
}

/// Frame codec for the TCP stream: magic (4) + length (4) + gzip(JSON).
pub struct WireCodec;

impl Encoder<ChunkEnvelope> for WireCodec {
    type Error = TransportError;

    fn encode(&mut self, item: ChunkEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = encode_datagram(&item)?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(data.len()));
        }
        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = ChunkEnvelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        if src[..4] != MAGIC {
            return Err(TransportError::BadMagic);
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }
        if src.len() < 8 + len {
            return Ok(None);
        }
        src.advance(8);
        let data = src.split_to(len);
        Ok(Some(decode_datagram(&data)?))
    }
}
