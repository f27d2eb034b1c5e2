//! JSON wire protocol for increment synchronization.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! client → server
//! ┌────────────────────────────┬───────────────────────┬──────────────────────────────┐
//! │ type                       │ payload               │ chunkInfo                    │
//! │ "relay" | "pull" | "push"  │ JSON document, as a   │ { id, position, count }      │
//! │                            │ string (chunkable)    │ count == 1 → not chunked     │
//! └────────────────────────────┴───────────────────────┴──────────────────────────────┘
//!
//! server → client
//!   { "type": "relayed",      "payload": <opaque JSON> }
//!   { "type": "acknowledged", "payload": { "increments": [{ id, version, payload }] } }
//!   { "type": "rejected",     "payload": { "increments": [...], "message": "..." } }
//! ```
//!
//! The envelope payload stays a string on the wire so that a sender can cut
//! it into several envelopes sharing one chunk id (see [`crate::chunk`]).
//! Only after reassembly is it parsed into a [`ClientMessage`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Server-assigned, per-room, gap-free increment version. Starts at 1.
pub type Version = u64;

/// An increment as submitted by a client, before the server versions it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIncrement {
    /// Client-generated unique id, used for deduplication.
    pub id: String,
    /// Opaque serialized change, owned by the element data model.
    pub payload: String,
}

impl ClientIncrement {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// A persisted increment carrying its authoritative version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIncrement {
    pub id: String,
    pub version: Version,
    pub payload: String,
}

impl ServerIncrement {
    pub fn new(id: impl Into<String>, version: Version, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version,
            payload: payload.into(),
        }
    }
}

/// Client → server message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Opaque low-latency data (presence, cursors), never persisted
    Relay,
    /// Catch-up request for increments newer than a known version
    Pull,
    /// Ephemeral or durable increments
    Push,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Relay => write!(f, "relay"),
            MessageType::Pull => write!(f, "pull"),
            MessageType::Push => write!(f, "push"),
        }
    }
}

/// Chunk framing for one logical message.
///
/// When `count == 1` the message is whole and `id`/`position` are
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: String,
    pub position: u32,
    pub count: u32,
}

impl ChunkInfo {
    /// Framing for an unchunked message.
    pub fn single() -> Self {
        Self {
            id: String::new(),
            position: 0,
            count: 1,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.count > 1
    }
}

impl Default for ChunkInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// Client → server envelope, possibly one chunk of a larger message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// JSON document serialized to a string (or one fragment of it)
    pub payload: String,
    #[serde(default)]
    pub chunk_info: ChunkInfo,
}

impl Envelope {
    /// Create an unchunked envelope.
    pub fn single(message_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
            chunk_info: ChunkInfo::single(),
        }
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Whether pushed increments must be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushKind {
    Ephemeral,
    Durable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub kind: PushKind,
    pub increments: Vec<ClientIncrement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPayload {
    pub last_acknowledged_version: Version,
}

/// A relay body: any JSON document, kept as the exact text the client sent.
///
/// The server checks that it parses but never re-encodes it, so key order,
/// number formatting and whitespace reach the other sessions unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayPayload(Box<RawValue>);

impl RelayPayload {
    /// Validate `json` and keep it byte for byte.
    pub fn from_json(json: impl Into<String>) -> Result<Self, ProtocolError> {
        RawValue::from_string(json.into())
            .map(Self)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Serialize any value into a relay body.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::value::to_raw_value(value)
            .map(Self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// The JSON text as received.
    pub fn get(&self) -> &str {
        self.0.get()
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ProtocolError> {
        deserialize(self.get())
    }
}

impl PartialEq for RelayPayload {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl fmt::Display for RelayPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.get())
    }
}

/// A fully reassembled client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Forwarded verbatim to the other sessions of the room.
    Relay(RelayPayload),
    Pull(PullPayload),
    Push(PushPayload),
}

impl ClientMessage {
    /// Parse a reassembled payload according to its envelope type.
    pub fn parse(message_type: MessageType, payload: &str) -> Result<Self, ProtocolError> {
        let message = match message_type {
            MessageType::Relay => ClientMessage::Relay(RelayPayload::from_json(payload)?),
            MessageType::Pull => ClientMessage::Pull(deserialize(payload)?),
            MessageType::Push => ClientMessage::Push(deserialize(payload)?),
        };
        Ok(message)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Relay(_) => MessageType::Relay,
            ClientMessage::Pull(_) => MessageType::Pull,
            ClientMessage::Push(_) => MessageType::Push,
        }
    }

    /// Serialize the payload part, ready to be framed into envelopes.
    pub fn encode_payload(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            ClientMessage::Relay(relay) => Ok(relay.get().to_owned()),
            ClientMessage::Pull(pull) => serde_json::to_string(pull),
            ClientMessage::Push(push) => serde_json::to_string(push),
        };
        encoded.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgedPayload {
    pub increments: Vec<ServerIncrement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub increments: Vec<ClientIncrement>,
    pub message: String,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ServerMessage {
    Relayed(RelayPayload),
    Acknowledged(AcknowledgedPayload),
    Rejected(RejectedPayload),
}

impl ServerMessage {
    pub fn acknowledged(increments: Vec<ServerIncrement>) -> Self {
        ServerMessage::Acknowledged(AcknowledgedPayload { increments })
    }

    pub fn rejected(increments: Vec<ClientIncrement>, message: impl Into<String>) -> Self {
        ServerMessage::Rejected(RejectedPayload {
            increments,
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        deserialize(raw)
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
