//! Durable, append-only increment log.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  save_all / get_since_version  ┌─────────────────────────┐
//! │ ServerSession│ ─────────────────────────────► │ dyn IncrementRepository │
//! │ (room lock)  │                                │ (one per room)          │
//! └──────────────┘                                └───────────┬─────────────┘
//!                                                             │
//!                                  ┌──────────────────────────┴──────────────┐
//!                                  ▼                                         ▼
//!                        ┌───────────────────┐                   ┌──────────────────────┐
//!                        │ MemoryIncrementStore│                 │ RocksRoomLog         │
//!                        │ (tests, ephemeral)  │                 │ CF "increments" rows │
//!                        └───────────────────┘                   │ CF "ids"   id→version│
//!                                                                │ CF "rooms" metadata  │
//!                                                                └──────────────────────┘
//! ```
//!
//! Payloads larger than `max_row_bytes` are split into several rows keyed by
//! `(room, version, position)` and written in one atomic batch together with
//! the id index, so an increment is either fully persisted or not at all.

pub mod memory;
pub mod rocks;
pub mod rows;

pub use memory::MemoryIncrementStore;
pub use rocks::{RocksIncrementStore, RocksRoomLog, RoomMetadata, StoreConfig};
pub use rows::{IncrementRow, DEFAULT_MAX_ROW_BYTES};

use thiserror::Error;

use crate::protocol::{ClientIncrement, ServerIncrement, Version};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend failure (RocksDB, I/O)
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// A stored row set cannot be reassembled
    #[error("Corrupt increment {id}: {details}")]
    Corrupt { id: String, details: String },
    #[error("Store lock poisoned")]
    Poisoned,
    #[error("Save produced no record")]
    EmptyBatch,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The per-room log store contract.
///
/// Saves are idempotent on the increment id: an id that is already stored
/// resolves to the stored record and consumes no version. Versions start at
/// 1 and have no gaps.
pub trait IncrementRepository: Send + Sync {
    /// Persist a batch atomically, returning one record per input increment
    /// in input order.
    fn save_all(&self, increments: &[ClientIncrement]) -> Result<Vec<ServerIncrement>, StoreError>;

    /// Persist one increment.
    fn save(&self, increment: &ClientIncrement) -> Result<ServerIncrement, StoreError> {
        self.save_all(std::slice::from_ref(increment))?
            .pop()
            .ok_or(StoreError::EmptyBatch)
    }

    /// All increments with a version strictly greater than `version`, ascending.
    fn get_since_version(&self, version: Version) -> Result<Vec<ServerIncrement>, StoreError>;

    /// Version of the newest increment, 0 when the log is empty.
    fn get_last_version(&self) -> Result<Version, StoreError>;

    fn get_by_id(&self, id: &str) -> Result<Option<ServerIncrement>, StoreError>;
}
