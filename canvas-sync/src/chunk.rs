//! Chunk framing for messages larger than one transport frame.
//!
//! Senders cut an oversized payload into envelopes sharing a chunk id;
//! receivers hold them in a [`ChunkAssembler`] until the set is complete.
//!
//! Per chunk id:
//! ```text
//! first chunk ──► Collecting { received, total } ──► Complete(payload) ──► removed
//!                        │
//!                        └── disconnect / stale timeout / bad metadata ──► evicted
//! ```
//!
//! A partial set is never handed out. The assembler is owned by a single
//! connection, so one peer's slow upload never blocks another's messages.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ChunkInfo, Envelope, MessageType};

/// Smallest accepted chunk size; one UTF-8 scalar is at most 4 bytes.
pub const MIN_CHUNK_BYTES: usize = 4;

/// Default lifetime of an incomplete chunk set.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on incomplete chunk sets held per connection.
pub const DEFAULT_MAX_PENDING_SETS: usize = 16;

/// Default cap on fragment bytes held per connection (64 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;

/// Bounds on what one connection may hold in incomplete chunk sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_pending_sets: usize,
    pub max_buffered_bytes: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_pending_sets: DEFAULT_MAX_PENDING_SETS,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

/// Split a payload into envelopes of at most `max_chunk_bytes` payload bytes.
///
/// Fragments end on character boundaries so every fragment stays valid UTF-8.
/// A payload that fits is returned as one unchunked envelope.
pub fn split_payload(
    message_type: MessageType,
    payload: &str,
    max_chunk_bytes: usize,
) -> Vec<Envelope> {
    let fragments = split_str(payload, max_chunk_bytes);
    if fragments.len() == 1 {
        return vec![Envelope::single(message_type, payload)];
    }

    let id = Uuid::new_v4().to_string();
    let count = fragments.len() as u32;
    fragments
        .into_iter()
        .enumerate()
        .map(|(position, fragment)| Envelope {
            message_type,
            payload: fragment.to_string(),
            chunk_info: ChunkInfo {
                id: id.clone(),
                position: position as u32,
                count,
            },
        })
        .collect()
}

fn split_str(s: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(MIN_CHUNK_BYTES);
    let mut fragments = Vec::with_capacity(s.len() / max_bytes + 1);
    let mut rest = s;
    while rest.len() > max_bytes {
        let mut end = max_bytes;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        fragments.push(head);
        rest = tail;
    }
    fragments.push(rest);
    fragments
}

/// Result of feeding one envelope to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    /// More chunks are needed before the message can be processed.
    Collecting { received: u32, total: u32 },
    /// The message is whole; the buffer for its chunk id is gone.
    Complete {
        message_type: MessageType,
        payload: String,
    },
}

/// Invalid chunk metadata. The offending chunk set is evicted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Chunk count must be at least 1")]
    ZeroCount,
    #[error("Chunk position {position} out of range for count {count}")]
    PositionOutOfRange { position: u32, count: u32 },
    #[error("Chunk set {id} announced {expected} chunks, got a chunk claiming {actual}")]
    CountMismatch { id: String, expected: u32, actual: u32 },
    #[error("Chunk set {id} started as {expected}, got a {actual} chunk")]
    TypeMismatch {
        id: String,
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Chunk set {id} refused: {limit} incomplete sets already pending")]
    TooManySets { id: String, limit: usize },
    #[error("Chunk set {id} dropped: buffered fragments would exceed {limit} bytes")]
    BufferLimit { id: String, limit: usize },
}

#[derive(Debug)]
struct ChunkBuffer {
    message_type: MessageType,
    count: u32,
    fragments: BTreeMap<u32, String>,
    started_at: Instant,
}

impl ChunkBuffer {
    fn new(message_type: MessageType, count: u32, started_at: Instant) -> Self {
        Self {
            message_type,
            count,
            fragments: BTreeMap::new(),
            started_at,
        }
    }

    fn received(&self) -> u32 {
        self.fragments.len() as u32
    }

    fn bytes(&self) -> usize {
        self.fragments.values().map(String::len).sum()
    }

    /// Concatenate fragments in position order.
    fn concat(self) -> String {
        let mut payload = String::with_capacity(self.bytes());
        for fragment in self.fragments.into_values() {
            payload.push_str(&fragment);
        }
        payload
    }
}

/// Reassembly buffers keyed by chunk id.
#[derive(Debug)]
pub struct ChunkAssembler {
    buffers: HashMap<String, ChunkBuffer>,
    max_age: Duration,
    limits: ChunkLimits,
    /// Fragment bytes across all buffers
    buffered_bytes: usize,
}

impl ChunkAssembler {
    /// Create an assembler that drops incomplete sets older than `max_age`
    /// when [`evict_stale`](Self::evict_stale) runs.
    pub fn new(max_age: Duration) -> Self {
        Self::with_limits(max_age, ChunkLimits::default())
    }

    pub fn with_limits(max_age: Duration, limits: ChunkLimits) -> Self {
        Self {
            buffers: HashMap::new(),
            max_age,
            limits,
            buffered_bytes: 0,
        }
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Feed one envelope.
    pub fn accept(&mut self, envelope: Envelope) -> Result<ChunkProgress, ChunkError> {
        self.accept_at(envelope, Instant::now())
    }

    fn accept_at(&mut self, envelope: Envelope, now: Instant) -> Result<ChunkProgress, ChunkError> {
        let Envelope {
            message_type,
            payload,
            chunk_info,
        } = envelope;
        let ChunkInfo {
            id,
            position,
            count,
        } = chunk_info;

        if count == 0 {
            self.remove_set(&id);
            return Err(ChunkError::ZeroCount);
        }
        if position >= count {
            self.remove_set(&id);
            return Err(ChunkError::PositionOutOfRange { position, count });
        }
        if count == 1 {
            return Ok(ChunkProgress::Complete {
                message_type,
                payload,
            });
        }

        if !self.buffers.contains_key(&id) && self.buffers.len() >= self.limits.max_pending_sets {
            return Err(ChunkError::TooManySets {
                id,
                limit: self.limits.max_pending_sets,
            });
        }

        let buffer = self
            .buffers
            .entry(id.clone())
            .or_insert_with(|| ChunkBuffer::new(message_type, count, now));

        if buffer.count != count {
            let expected = buffer.count;
            self.remove_set(&id);
            return Err(ChunkError::CountMismatch {
                id,
                expected,
                actual: count,
            });
        }
        if buffer.message_type != message_type {
            let expected = buffer.message_type;
            self.remove_set(&id);
            return Err(ChunkError::TypeMismatch {
                id,
                expected,
                actual: message_type,
            });
        }

        let replaced = buffer.fragments.get(&position).map_or(0, String::len);
        if self.buffered_bytes - replaced + payload.len() > self.limits.max_buffered_bytes {
            let limit = self.limits.max_buffered_bytes;
            self.remove_set(&id);
            return Err(ChunkError::BufferLimit { id, limit });
        }

        // A redelivered position replaces its fragment
        self.buffered_bytes = self.buffered_bytes - replaced + payload.len();
        buffer.fragments.insert(position, payload);
        let received = buffer.received();

        if received == count {
            if let Some(buffer) = self.remove_set(&id) {
                return Ok(ChunkProgress::Complete {
                    message_type,
                    payload: buffer.concat(),
                });
            }
        }

        Ok(ChunkProgress::Collecting {
            received,
            total: count,
        })
    }

    /// Drop one incomplete chunk set.
    pub fn evict(&mut self, chunk_id: &str) -> bool {
        self.remove_set(chunk_id).is_some()
    }

    fn remove_set(&mut self, chunk_id: &str) -> Option<ChunkBuffer> {
        let buffer = self.buffers.remove(chunk_id)?;
        self.buffered_bytes -= buffer.bytes();
        Some(buffer)
    }

    /// Drop incomplete sets whose first chunk arrived more than `max_age` ago.
    /// Returns the number of sets evicted.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.saturating_duration_since(buffer.started_at) <= max_age);
        self.buffered_bytes = self.buffers.values().map(ChunkBuffer::bytes).sum();
        before - self.buffers.len()
    }

    /// Drop everything, e.g. when the owning connection goes away.
    pub fn clear(&mut self) -> usize {
        let count = self.buffers.len();
        self.buffers.clear();
        self.buffered_bytes = 0;
        count
    }

    /// Number of incomplete chunk sets.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Payload bytes held by incomplete chunk sets.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_TIMEOUT)
    }
}
