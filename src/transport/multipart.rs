//! Multipart chunking, index-addressed reassembly, and self-broadcast
//! suppression.

use crate::message::{ChunkEnvelope, Envelope};
use crate::transport::codec::MAX_FRAME_SIZE;
use crate::transport::TransportError;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Upper bound on one logical message's declared total length.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Split a logical payload into chunk envelopes sharing the head's id.
///
/// A payload no larger than `chunk_size` produces a single chunk that
/// completes immediately on the receiving side.
pub fn split_into_chunks(head: &Envelope, payload: &[u8], chunk_size: usize) -> Vec<ChunkEnvelope> {
    let total = payload.len();
    let count = total.div_ceil(chunk_size).max(1);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(total);
            ChunkEnvelope {
                head: head.clone(),
                chunk_no: i as u32,
                chunks_count: count as u32,
                chunk_size: (end - start) as u32,
                chunk_total_size: total as u64,
                raw_data: payload[start..end].to_vec(),
            }
        })
        .collect()
}

struct Partial {
    buf: Vec<u8>,
    received: Vec<bool>,
    last_seen: Instant,
}

impl Partial {
    fn new(total: usize, count: usize) -> Self {
        Self {
            buf: vec![0; total],
            received: vec![false; count],
            last_seen: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|b| *b)
    }
}

/// Reassembles multipart messages keyed by message id.
///
/// Chunks may arrive in any order; each is copied into its slot in a
/// buffer sized to the total length, with a bitset tracking receipt.
/// Completed buffers are handed out and their state deleted at once.
/// Buffers whose remaining chunks never arrive are evicted by
/// [`sweep`](Self::sweep) after sitting idle for the configured timeout.
pub struct Reassembler {
    partials: DashMap<Uuid, Partial>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partials: DashMap::new(),
            timeout,
        }
    }

    /// Accept one chunk. Returns the full payload once every chunk has
    /// arrived, or `None` while parts are still outstanding; the caller
    /// must treat that as "wait for more", not as a failure.
    pub fn accept(&self, chunk: &ChunkEnvelope) -> Result<Option<Vec<u8>>, TransportError> {
        let count = chunk.chunks_count as usize;
        let total = chunk.chunk_total_size as usize;
        let size = chunk.chunk_size as usize;
        let no = chunk.chunk_no as usize;

        if count == 0 {
            return Err(TransportError::MalformedChunk("zero chunk count"));
        }
        if no >= count {
            return Err(TransportError::MalformedChunk("chunk index out of range"));
        }
        if chunk.raw_data.len() != size {
            return Err(TransportError::MalformedChunk("declared size mismatch"));
        }
        // The totals are sender-declared and size the buffer and bitset
        // allocations, so each is bounded before any entry is created
        if chunk.chunk_total_size > MAX_MESSAGE_SIZE {
            return Err(TransportError::MalformedChunk("total exceeds message limit"));
        }
        if chunk.chunk_total_size > chunk.chunks_count as u64 * MAX_FRAME_SIZE as u64 {
            return Err(TransportError::MalformedChunk("implausible total length"));
        }
        if count as u64 > chunk.chunk_total_size.max(1) {
            return Err(TransportError::MalformedChunk("more chunks than bytes"));
        }
        // Every chunk but the last carries the sender's full stride, so
        // stride * count must cover the declared total
        if no + 1 < count && (size as u64) * (count as u64) < chunk.chunk_total_size {
            return Err(TransportError::MalformedChunk("chunk stride below declared total"));
        }
        // Offsets are self-describing: every chunk except the last starts
        // at index * its own (uniform) size; the last lands at the end.
        let offset = if no + 1 == count { total.saturating_sub(size) } else { no * size };
        if offset + size > total {
            return Err(TransportError::MalformedChunk("chunk exceeds total length"));
        }

        let mut entry = self
            .partials
            .entry(chunk.head.id)
            .or_insert_with(|| Partial::new(total, count));
        let partial = entry.value_mut();
        if partial.buf.len() != total || partial.received.len() != count {
            return Err(TransportError::MalformedChunk(
                "inconsistent totals across chunks of one message",
            ));
        }

        partial.buf[offset..offset + size].copy_from_slice(&chunk.raw_data);
        partial.received[no] = true;
        partial.last_seen = Instant::now();

        if partial.is_complete() {
            drop(entry);
            let (_, done) = self
                .partials
                .remove(&chunk.head.id)
                .ok_or(TransportError::MalformedChunk("completed buffer vanished"))?;
            return Ok(Some(done.buf));
        }
        Ok(None)
    }

    /// Evict partial buffers idle longer than the timeout. Returns how
    /// many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.partials.len();
        let timeout = self.timeout;
        self.partials.retain(|id, partial| {
            let keep = partial.last_seen.elapsed() <= timeout;
            if !keep {
                log::debug!("evicting abandoned multipart buffer {}", id);
            }
            keep
        });
        before - self.partials.len()
    }

    /// Number of messages currently awaiting more chunks.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

/// Cache of recently broadcast message ids.
///
/// Prevents a node from re-processing its own broadcast when it loops
/// back via a relaying peer. Entries expire lazily on lookup; no
/// background sweep runs.
pub struct SuppressionCache {
    seen: DashMap<Uuid, Instant>,
    window: Duration,
}

impl SuppressionCache {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    /// Record an id at broadcast time.
    pub fn record(&self, id: Uuid) {
        self.seen.insert(id, Instant::now());
    }

    /// Is this id still inside its suppression window? Expired entries
    /// are removed on the way out.
    pub fn contains(&self, id: &Uuid) -> bool {
        // Drop the shard guard before removing
        let expired = match self.seen.get(id) {
            Some(entry) => entry.elapsed() > self.window,
            None => return false,
        };
        if !expired {
            return true;
        }
        // Window elapsed: same id arriving again counts as a new message.
        log::debug!("suppression window elapsed for {}, treating as new", id);
        self.seen.remove(id);
        false
    }
}
