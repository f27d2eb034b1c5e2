//! # canvas-sync: real-time increment synchronization for shared canvases
//!
//! Keeps every client of a room on one linear, server-versioned history of
//! increments, over WebSocket, with chunking for oversized messages and
//! at-most-once application on the client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket       ┌──────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer   │
//! │ + Replica   │   JSON envelopes     │ RoomRegistry │
//! └──────┬──────┘   (chunked)          └──────┬───────┘
//!        │                                    │ per room
//!        ▼                                    ▼
//! ┌─────────────┐                  ┌────────────────────┐
//! │ sync state  │                  │ push lock          │
//! │ (JSON file) │                  │ IncrementRepository│──► RocksDB / memory
//! └─────────────┘                  │ SessionSet fan-out │
//!                                  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Envelope and message types
//! - [`chunk`]: Payload splitting and per-connection reassembly
//! - [`storage`]: Append-only increment log (RocksDB and in-memory)
//! - [`broadcast`]: Per-room session fan-out with backpressure
//! - [`room`]: Room ids, rooms and the room registry
//! - [`server`]: Per-session message handling and the WebSocket server
//! - [`client`]: WebSocket client with pending-increment replay

pub mod protocol;
pub mod chunk;
pub mod storage;
pub mod broadcast;
pub mod room;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientIncrement, ClientMessage, Envelope, MessageType, ProtocolError, PushKind, RelayPayload,
    ServerIncrement, ServerMessage, Version,
};
pub use chunk::{split_payload, ChunkAssembler, ChunkError, ChunkLimits, ChunkProgress};
pub use storage::{
    IncrementRepository, MemoryIncrementStore, RocksIncrementStore, RocksRoomLog, RoomMetadata,
    StoreConfig, StoreError,
};
pub use broadcast::{BroadcastStats, Delivery, SessionSet};
pub use room::{Room, RoomId, RoomIdError, RoomRegistry, StorageBackend};
pub use server::{
    ConfigError, MessageOutcome, ServerConfig, ServerError, ServerSession, ServerStats, SyncServer,
};
pub use client::{
    ClientConfig, ClientError, ClientSyncState, ConnectionState, Replica, SyncClient, SyncEvent,
};
