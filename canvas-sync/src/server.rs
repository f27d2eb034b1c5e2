//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<room>
//!            ├── ServerSession ──┬── ChunkAssembler (per connection)
//! Client B ──┘                   │
//!                                ▼
//!                     Room ── push lock ── IncrementRepository
//!                       │
//!                       └── SessionSet ──┬──► Client A
//!                                        └──► Client B
//! ```
//!
//! Durable pushes are saved and broadcast while the room's push lock is held,
//! so versions reach every session in the order they were assigned. Relays,
//! ephemeral pushes and pulls never take the lock. A peer too slow to take an
//! acknowledgement is evicted rather than awaited.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Delivery, Frame, SessionId};
use crate::chunk::{
    ChunkAssembler, ChunkLimits, ChunkProgress, DEFAULT_CHUNK_TIMEOUT, DEFAULT_MAX_BUFFERED_BYTES,
    DEFAULT_MAX_PENDING_SETS,
};
use crate::protocol::{
    ClientIncrement, ClientMessage, Envelope, ProtocolError, PullPayload, PushKind, RelayPayload,
    ServerMessage,
};
use crate::room::{Room, RoomId, RoomRegistry, StorageBackend};
use crate::storage::{RocksIncrementStore, RoomMetadata, StoreConfig, StoreError, DEFAULT_MAX_ROW_BYTES};

/// Prefix of every environment override read by [`ServerConfig::from_env`].
pub const ENV_PREFIX: &str = "CANVAS_SYNC_";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// Outbound frames buffered per session
    pub session_buffer: usize,
    /// Lifetime of an incomplete chunk set, in seconds
    pub chunk_timeout_secs: u64,
    /// Incomplete chunk sets one session may hold
    pub max_pending_chunk_sets: usize,
    /// Fragment bytes one session may hold across its incomplete chunk sets
    pub max_chunk_buffer_bytes: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Maximum payload bytes per stored row
    pub max_row_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_room: 100,
            session_buffer: 256,
            chunk_timeout_secs: DEFAULT_CHUNK_TIMEOUT.as_secs(),
            max_pending_chunk_sets: DEFAULT_MAX_PENDING_SETS,
            max_chunk_buffer_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            storage_path: None,
            max_row_bytes: DEFAULT_MAX_ROW_BYTES,
        }
    }
}

/// An environment override that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value {value:?} for {key}: {details}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub details: String,
}

impl ServerConfig {
    /// Defaults overridden by `CANVAS_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `CANVAS_SYNC_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        let mut config = Self::default();
        if let Some((_, addr)) = get("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some((_, path)) = get("STORAGE_PATH") {
            config.storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some((key, value)) = get("MAX_SESSIONS_PER_ROOM") {
            config.max_sessions_per_room = parse_positive(key, value)?;
        }
        if let Some((key, value)) = get("SESSION_BUFFER") {
            config.session_buffer = parse_positive(key, value)?;
        }
        if let Some((key, value)) = get("CHUNK_TIMEOUT_SECS") {
            config.chunk_timeout_secs = parse_positive(key, value)? as u64;
        }
        if let Some((key, value)) = get("MAX_PENDING_CHUNK_SETS") {
            config.max_pending_chunk_sets = parse_positive(key, value)?;
        }
        if let Some((key, value)) = get("MAX_CHUNK_BUFFER_BYTES") {
            config.max_chunk_buffer_bytes = parse_positive(key, value)?;
        }
        if let Some((key, value)) = get("MAX_ROW_BYTES") {
            config.max_row_bytes = parse_positive(key, value)?;
        }
        Ok(config)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs.max(1))
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_pending_sets: self.max_pending_chunk_sets,
            max_buffered_bytes: self.max_chunk_buffer_bytes,
        }
    }
}

fn parse_positive(key: String, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError {
            key,
            value,
            details: "must be greater than zero".into(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError {
            key,
            value,
            details: e.to_string(),
        }),
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Room {room} is full ({limit} sessions)")]
    RoomFull { room: RoomId, limit: usize },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Handshakes refused for a bad room id or a full room
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Increments acknowledged to durable pushes, retries included
    pub acknowledged_increments: u64,
    pub rejected_pushes: u64,
    pub refused_pulls: u64,
    pub dropped_messages: u64,
}

impl ServerStats {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged { increments } => {
                self.acknowledged_increments += *increments as u64;
            }
            MessageOutcome::Rejected => self.rejected_pushes += 1,
            MessageOutcome::Refused => self.refused_pulls += 1,
            MessageOutcome::Dropped => self.dropped_messages += 1,
            MessageOutcome::Buffered { .. }
            | MessageOutcome::Relayed { .. }
            | MessageOutcome::Pulled { .. } => {}
        }
    }
}

/// What handling one inbound frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A chunk was stored; the message is not complete yet.
    Buffered { received: u32, total: u32 },
    /// Malformed input, logged and discarded.
    Dropped,
    /// Relay or ephemeral push queued for `receivers` other sessions.
    Relayed { receivers: usize },
    /// Catch-up batch sent to the requester.
    Pulled { increments: usize },
    /// Pull from a client ahead of the server; no reply was sent.
    Refused,
    /// Durable push saved and broadcast to every session.
    Acknowledged { increments: usize },
    /// Durable push failed to persist; the sender was told.
    Rejected,
}

/// Body of the relay an ephemeral push turns into.
#[derive(Serialize)]
struct EphemeralIncrements<'a> {
    increments: &'a [ClientIncrement],
}

/// Server side of one connection, bound to exactly one room.
pub struct ServerSession {
    id: SessionId,
    room: Arc<Room>,
    chunks: ChunkAssembler,
}

impl ServerSession {
    /// Join `room`, returning the session and the receiver of its outbound frames.
    pub async fn connect(
        room: Arc<Room>,
        max_sessions: usize,
        chunk_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<Frame>), ServerError> {
        let id = Uuid::new_v4();
        let Some(rx) = room.sessions().try_add_session(id, max_sessions).await else {
            return Err(ServerError::RoomFull {
                room: room.id().clone(),
                limit: max_sessions,
            });
        };
        log::info!("Session {id} joined room {}", room.id());

        let session = Self {
            id,
            room,
            chunks: ChunkAssembler::new(chunk_timeout),
        };
        Ok((session, rx))
    }

    /// Leave the room. Returns the number of abandoned partial messages.
    pub async fn disconnect(mut self) -> usize {
        self.room.sessions().remove_session(&self.id).await;
        let abandoned = self.chunks.clear();
        if abandoned > 0 {
            log::debug!("Session {} left with {abandoned} incomplete chunk sets", self.id);
        }
        log::info!("Session {} left room {}", self.id, self.room.id());
        abandoned
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Replace the default bounds on this session's incomplete chunk sets.
    pub fn with_chunk_limits(mut self, limits: ChunkLimits) -> Self {
        self.chunks = ChunkAssembler::with_limits(self.chunks.max_age(), limits);
        self
    }

    /// Incomplete chunk sets held for this session.
    pub fn pending_chunks(&self) -> usize {
        self.chunks.pending()
    }

    pub fn evict_stale_chunks(&mut self) -> usize {
        let evicted = self.chunks.evict_stale(std::time::Instant::now());
        if evicted > 0 {
            log::warn!("Session {} evicted {evicted} stale chunk sets", self.id);
        }
        evicted
    }

    /// Handle one raw text frame.
    pub async fn on_message(&mut self, raw: &str) -> MessageOutcome {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Session {}: dropping malformed envelope: {e}", self.id);
                return MessageOutcome::Dropped;
            }
        };

        let (message_type, payload) = match self.chunks.accept(envelope) {
            Ok(ChunkProgress::Complete {
                message_type,
                payload,
            }) => (message_type, payload),
            Ok(ChunkProgress::Collecting { received, total }) => {
                log::trace!("Session {}: chunk {received}/{total}", self.id);
                return MessageOutcome::Buffered { received, total };
            }
            Err(e) => {
                log::warn!("Session {}: dropping chunk set: {e}", self.id);
                return MessageOutcome::Dropped;
            }
        };

        match ClientMessage::parse(message_type, &payload) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                log::warn!("Session {}: dropping {message_type} payload: {e}", self.id);
                MessageOutcome::Dropped
            }
        }
    }

    /// Handle one reassembled message.
    pub async fn dispatch(&mut self, message: ClientMessage) -> MessageOutcome {
        log::debug!("Session {}: {} message", self.id, message.message_type());
        match message {
            ClientMessage::Relay(payload) => self.relay(ServerMessage::Relayed(payload)).await,
            ClientMessage::Pull(pull) => self.pull(pull).await,
            ClientMessage::Push(push) => match push.kind {
                PushKind::Ephemeral => {
                    let body = EphemeralIncrements {
                        increments: &push.increments,
                    };
                    match RelayPayload::from_value(&body) {
                        Ok(payload) => self.relay(ServerMessage::Relayed(payload)).await,
                        Err(e) => {
                            log::warn!("Session {}: dropping ephemeral push: {e}", self.id);
                            MessageOutcome::Dropped
                        }
                    }
                }
                PushKind::Durable => self.push_durable(push.increments).await,
            },
        }
    }

    async fn relay(&self, message: ServerMessage) -> MessageOutcome {
        match self
            .room
            .sessions()
            .broadcast(&message, Some(self.id), Delivery::BestEffort)
            .await
        {
            Ok(receivers) => {
                log::trace!("Session {}: relayed to {receivers} sessions", self.id);
                MessageOutcome::Relayed { receivers }
            }
            Err(e) => {
                log::warn!("Session {}: relay failed: {e}", self.id);
                MessageOutcome::Dropped
            }
        }
    }

    async fn pull(&self, pull: PullPayload) -> MessageOutcome {
        let client_version = pull.last_acknowledged_version;
        let log = self.room.log();

        let server_version = match log.get_last_version() {
            Ok(version) => version,
            Err(e) => {
                log::error!("Room {}: reading last version failed: {e}", self.room.id());
                return MessageOutcome::Dropped;
            }
        };

        if client_version > server_version {
            log::error!(
                "Session {} in room {} claims version {client_version}, server is at {server_version}",
                self.id,
                self.room.id()
            );
            return MessageOutcome::Refused;
        }

        let increments = if client_version == server_version {
            Vec::new()
        } else {
            match log.get_since_version(client_version) {
                Ok(increments) => increments,
                Err(e) => {
                    log::error!("Room {}: catch-up read failed: {e}", self.room.id());
                    return MessageOutcome::Dropped;
                }
            }
        };

        let count = increments.len();
        let reply = ServerMessage::acknowledged(increments);
        match self.room.sessions().send_to(&self.id, &reply, Delivery::Reliable).await {
            Ok(_) => MessageOutcome::Pulled { increments: count },
            Err(e) => {
                log::warn!("Session {}: catch-up reply failed: {e}", self.id);
                MessageOutcome::Dropped
            }
        }
    }

    async fn push_durable(&self, increments: Vec<ClientIncrement>) -> MessageOutcome {
        if increments.is_empty() {
            let ack = ServerMessage::acknowledged(Vec::new());
            if let Err(e) = self.room.sessions().send_to(&self.id, &ack, Delivery::Reliable).await {
                log::warn!("Session {}: empty acknowledgement failed: {e}", self.id);
            }
            return MessageOutcome::Acknowledged { increments: 0 };
        }

        let _guard = self.room.lock_pushes().await;

        let saved = match self.room.log().save_all(&increments) {
            Ok(saved) => saved,
            Err(e) => {
                log::error!(
                    "Room {}: persisting {} increments failed: {e}",
                    self.room.id(),
                    increments.len()
                );
                let reply = ServerMessage::rejected(increments, e.to_string());
                if let Err(e) = self.room.sessions().send_to(&self.id, &reply, Delivery::Reliable).await {
                    log::warn!("Session {}: rejection reply failed: {e}", self.id);
                }
                return MessageOutcome::Rejected;
            }
        };

        let count = saved.len();
        if let Some(last) = saved.iter().map(|inc| inc.version).max() {
            log::debug!("Room {}: acknowledged {count} increments up to version {last}", self.room.id());
        }
        // Peers that cannot take the ack right away are evicted rather than
        // awaited: the push lock is held here.
        let ack = ServerMessage::acknowledged(saved);
        let sessions = self.room.sessions();
        if let Err(e) = sessions.broadcast(&ack, Some(self.id), Delivery::EvictLagging).await {
            log::error!("Room {}: acknowledgement broadcast failed: {e}", self.room.id());
        }
        if let Err(e) = sessions.send_to(&self.id, &ack, Delivery::Reliable).await {
            log::warn!("Session {}: acknowledgement reply failed: {e}", self.id);
        }
        MessageOutcome::Acknowledged { increments: count }
    }
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent store (None = in-memory rooms)
    store: Option<Arc<RocksIncrementStore>>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB store when a storage path is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let Some(path) = config.storage_path.clone() else {
            return Ok(Self::in_memory(config));
        };

        let store = Arc::new(RocksIncrementStore::open(StoreConfig {
            path,
            max_row_bytes: config.max_row_bytes,
            ..StoreConfig::default()
        })?);
        let registry = RoomRegistry::new(StorageBackend::Rocks(store.clone()), config.session_buffer);

        Ok(Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: Some(store),
        })
    }

    /// Create a server whose rooms live in memory only.
    pub fn in_memory(config: ServerConfig) -> Self {
        let backend = StorageBackend::Memory {
            max_row_bytes: config.max_row_bytes,
        };
        let registry = RoomRegistry::new(backend, config.session_buffer);
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: None,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::in_memory(ServerConfig::default())
    }

    /// Rooms found in persistent storage.
    pub fn persisted_rooms(&self) -> Result<Vec<RoomMetadata>, ServerError> {
        match &self.store {
            Some(store) => Ok(store.list_rooms()?),
            None => Ok(Vec::new()),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ConnectionContext {
                config: self.config.clone(),
                registry: self.registry.clone(),
                stats: self.stats.clone(),
            };

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), ServerError> {
        let mut requested_room: Option<RoomId> = None;
        let callback = |request: &Request, response: Response| match RoomId::from_path(request.uri().path()) {
            Ok(room_id) => {
                requested_room = Some(room_id);
                Ok(response)
            }
            Err(e) => {
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                ctx.stats.write().await.refused_connections += 1;
                log::warn!("Handshake with {addr} refused: {e}");
                return Ok(());
            }
        };
        let Some(room_id) = requested_room else {
            return Ok(());
        };

        let room = ctx.registry.get_or_create(&room_id).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (session, mut outbound) = match ServerSession::connect(
            room,
            ctx.config.max_sessions_per_room,
            ctx.config.chunk_timeout(),
        )
        .await
        {
            Ok(joined) => joined,
            Err(ServerError::RoomFull { room, limit }) => {
                ctx.stats.write().await.refused_connections += 1;
                log::warn!("Refusing {addr}: room {room} is at {limit} sessions");
                let close = CloseFrame {
                    code: CloseCode::Policy,
                    reason: "room is full".into(),
                };
                ws_sender.send(Message::Close(Some(close))).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut session = session.with_chunk_limits(ctx.config.chunk_limits());

        log::info!("WebSocket connection from {addr} in room {room_id}");
        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = ctx.registry.room_count().await;
        }

        // Writer task: drains the session queue even while this task waits on the push lock
        let (control_tx, mut control_rx) = mpsc::channel::<Message>(8);
        let mut writer = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => Message::text(frame.to_string()),
                        None => {
                            // Evicted from the room for falling behind
                            let close = CloseFrame {
                                code: CloseCode::Again,
                                reason: "session fell behind, reconnect and pull".into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(close))).await;
                            break;
                        }
                    },
                    control = control_rx.recv() => match control {
                        Some(message) => message,
                        None => break,
                    },
                };
                if let Err(e) = ws_sender.send(message).await {
                    log::debug!("Writer for {addr} stopped: {e}");
                    break;
                }
            }
        });

        let mut eviction = tokio::time::interval(ctx.config.chunk_timeout());
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let outcome = session.on_message(text.as_str()).await;
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                            s.record(&outcome);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Ignoring {} byte binary frame from {addr}", data.len());
                            ctx.stats.write().await.dropped_messages += 1;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if control_tx.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }
                _ = eviction.tick() => {
                    session.evict_stale_chunks();
                }
                _ = &mut writer => {
                    log::info!("Outbound stream to {addr} ended");
                    break;
                }
            }
        }

        session.disconnect().await;
        writer.abort();

        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<RocksIncrementStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split_payload;
    use crate::protocol::{MessageType, PushPayload, ServerIncrement, Version};
    use crate::storage::{IncrementRepository, MemoryIncrementStore};
    use serde_json::json;
    use std::collections::HashMap;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn room(name: &str) -> Arc<Room> {
        Arc::new(Room::new(
            RoomId::parse(name).unwrap(),
            Arc::new(MemoryIncrementStore::new()),
            64,
        ))
    }

    async fn join(room: &Arc<Room>) -> (ServerSession, mpsc::Receiver<Frame>) {
        ServerSession::connect(room.clone(), usize::MAX, TIMEOUT).await.unwrap()
    }

    fn next(rx: &mut mpsc::Receiver<Frame>) -> ServerMessage {
        ServerMessage::decode(&rx.try_recv().expect("frame queued")).unwrap()
    }

    fn push(kind: PushKind, increments: Vec<ClientIncrement>) -> String {
        let payload = ClientMessage::Push(PushPayload { kind, increments })
            .encode_payload()
            .unwrap();
        Envelope::single(MessageType::Push, payload).encode().unwrap()
    }

    fn pull(version: Version) -> String {
        let payload = ClientMessage::Pull(PullPayload {
            last_acknowledged_version: version,
        })
        .encode_payload()
        .unwrap();
        Envelope::single(MessageType::Pull, payload).encode().unwrap()
    }

    struct FailingRepository;

    impl IncrementRepository for FailingRepository {
        fn save_all(&self, _: &[ClientIncrement]) -> Result<Vec<ServerIncrement>, StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn get_since_version(&self, _: Version) -> Result<Vec<ServerIncrement>, StoreError> {
            Ok(Vec::new())
        }
        fn get_last_version(&self) -> Result<Version, StoreError> {
            Ok(0)
        }
        fn get_by_id(&self, _: &str) -> Result<Option<ServerIncrement>, StoreError> {
            Ok(None)
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_sessions_per_room, 100);
        assert_eq!(config.chunk_timeout(), DEFAULT_CHUNK_TIMEOUT);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<String, String> = [
            ("CANVAS_SYNC_BIND_ADDR", "0.0.0.0:8080"),
            ("CANVAS_SYNC_STORAGE_PATH", "/var/lib/canvas"),
            ("CANVAS_SYNC_MAX_SESSIONS_PER_ROOM", "12"),
            ("CANVAS_SYNC_CHUNK_TIMEOUT_SECS", " 5 "),
            ("CANVAS_SYNC_MAX_PENDING_CHUNK_SETS", "4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = ServerConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/canvas")));
        assert_eq!(config.max_sessions_per_room, 12);
        assert_eq!(config.chunk_timeout_secs, 5);
        assert_eq!(config.chunk_limits().max_pending_sets, 4);
        assert_eq!(config.chunk_limits().max_buffered_bytes, DEFAULT_MAX_BUFFERED_BYTES);
        assert_eq!(config.session_buffer, ServerConfig::default().session_buffer);
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let err = ServerConfig::from_lookup(|key| {
            (key == "CANVAS_SYNC_SESSION_BUFFER").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert_eq!(err.key, "CANVAS_SYNC_SESSION_BUFFER");
        assert_eq!(err.value, "lots");

        let err = ServerConfig::from_lookup(|key| {
            (key == "CANVAS_SYNC_MAX_ROW_BYTES").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert!(server.persisted_rooms().unwrap().is_empty());
        assert!(server.store().is_none());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        })
        .unwrap();
        assert!(server.store().is_some());

        let room = server.registry().get_or_create(&RoomId::parse("saved").unwrap()).await.unwrap();
        room.log().save(&ClientIncrement::new("a", "1")).unwrap();

        let rooms = server.persisted_rooms().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room_id, "saved");
    }

    #[tokio::test]
    async fn test_relay_skips_sender() {
        let room = room("relay");
        let (mut alice, mut alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        // Key order, number formatting and spacing must survive the relay
        let body = r#"{"z":1,"a":2.50, "pointer":{"y":2,"x":1e3}}"#;
        let raw = Envelope::single(MessageType::Relay, body).encode().unwrap();
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Relayed { receivers: 1 });

        let frame = bob_rx.try_recv().expect("frame queued");
        assert_eq!(&*frame, format!(r#"{{"type":"relayed","payload":{body}}}"#));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_relay_json_dropped() {
        let room = room("relay-bad");
        let (mut alice, _alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        let raw = Envelope::single(MessageType::Relay, r#"{"pointer":"#).encode().unwrap();
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Dropped);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_durable_push_acknowledged_to_all() {
        let room = room("durable");
        let (mut alice, mut alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        let raw = push(PushKind::Durable, vec![ClientIncrement::new("i1", "p1")]);
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Acknowledged { increments: 1 });

        let expected = ServerMessage::acknowledged(vec![ServerIncrement::new("i1", 1, "p1")]);
        assert_eq!(next(&mut alice_rx), expected);
        assert_eq!(next(&mut bob_rx), expected);

        // A retry is acknowledged with the stored version and consumes none
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Acknowledged { increments: 1 });
        assert_eq!(next(&mut alice_rx), expected);
        assert_eq!(room.log().get_last_version().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_push_not_persisted() {
        let room = room("ephemeral");
        let (mut alice, mut alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        let raw = push(PushKind::Ephemeral, vec![ClientIncrement::new("e1", "drag")]);
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Relayed { receivers: 1 });

        match next(&mut bob_rx) {
            ServerMessage::Relayed(relay) => assert_eq!(
                relay.to_value().unwrap(),
                json!({"increments": [{"id": "e1", "payload": "drag"}]})
            ),
            other => panic!("Expected relayed, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(room.log().get_last_version().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_catch_up() {
        let room = room("catchup");
        for i in 1..=3 {
            room.log().save(&ClientIncrement::new(format!("i{i}"), format!("p{i}"))).unwrap();
        }
        let (mut session, mut rx) = join(&room).await;

        assert_eq!(session.on_message(&pull(1)).await, MessageOutcome::Pulled { increments: 2 });
        assert_eq!(
            next(&mut rx),
            ServerMessage::acknowledged(vec![
                ServerIncrement::new("i2", 2, "p2"),
                ServerIncrement::new("i3", 3, "p3"),
            ])
        );

        assert_eq!(session.on_message(&pull(3)).await, MessageOutcome::Pulled { increments: 0 });
        assert_eq!(next(&mut rx), ServerMessage::acknowledged(Vec::new()));
    }

    #[tokio::test]
    async fn test_pull_ahead_of_server_refused() {
        let room = room("ahead");
        room.log().save(&ClientIncrement::new("only", "p")).unwrap();
        let (mut session, mut rx) = join(&room).await;

        assert_eq!(session.on_message(&pull(7)).await, MessageOutcome::Refused);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chunked_push_reassembled() {
        let room = room("chunks");
        let (mut session, mut rx) = join(&room).await;

        let big = "x".repeat(5_000);
        let payload = ClientMessage::Push(PushPayload {
            kind: PushKind::Durable,
            increments: vec![ClientIncrement::new("big", big.clone())],
        })
        .encode_payload()
        .unwrap();
        let mut envelopes = split_payload(MessageType::Push, &payload, 1_024);
        assert_eq!(envelopes.len(), 5);

        // Arrival order does not matter
        envelopes.reverse();
        let last = envelopes.pop().unwrap();
        for (i, envelope) in envelopes.iter().enumerate() {
            let outcome = session.on_message(&envelope.encode().unwrap()).await;
            assert_eq!(outcome, MessageOutcome::Buffered { received: i as u32 + 1, total: 5 });
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(room.log().get_last_version().unwrap(), 0);

        let outcome = session.on_message(&last.encode().unwrap()).await;
        assert_eq!(outcome, MessageOutcome::Acknowledged { increments: 1 });
        assert_eq!(next(&mut rx), ServerMessage::acknowledged(vec![ServerIncrement::new("big", 1, big)]));
        assert_eq!(session.pending_chunks(), 0);
    }

    #[tokio::test]
    async fn test_malformed_input_dropped() {
        let room = room("malformed");
        let (mut session, mut rx) = join(&room).await;

        assert_eq!(session.on_message("not json").await, MessageOutcome::Dropped);
        let bad_payload = Envelope::single(MessageType::Push, "{\"kind\":\"sometimes\"}")
            .encode()
            .unwrap();
        assert_eq!(session.on_message(&bad_payload).await, MessageOutcome::Dropped);
        let zero_count = r#"{"type":"push","payload":"","chunkInfo":{"id":"c","position":0,"count":0}}"#;
        assert_eq!(session.on_message(zero_count).await, MessageOutcome::Dropped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_rejects_sender_only() {
        let room = Arc::new(Room::new(RoomId::parse("broken").unwrap(), Arc::new(FailingRepository), 16));
        let (mut alice, mut alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        let increments = vec![ClientIncrement::new("i1", "p1")];
        let raw = push(PushKind::Durable, increments.clone());
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Rejected);

        match next(&mut alice_rx) {
            ServerMessage::Rejected(rejected) => {
                assert_eq!(rejected.increments, increments);
                assert!(rejected.message.contains("disk full"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_pushes_get_distinct_versions() {
        let room = Arc::new(Room::new(
            RoomId::parse("race").unwrap(),
            Arc::new(MemoryIncrementStore::new()),
            1_024,
        ));

        let mut tasks = Vec::new();
        for writer in 0..4 {
            let (mut session, rx) = join(&room).await;
            tasks.push(tokio::spawn(async move {
                let _rx = rx;
                for i in 0..25 {
                    let raw = push(PushKind::Durable, vec![ClientIncrement::new(format!("w{writer}-{i}"), "p")]);
                    session.on_message(&raw).await;
                }
                session.disconnect().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let versions: Vec<Version> = room
            .log()
            .get_since_version(0)
            .unwrap()
            .iter()
            .map(|inc| inc.version)
            .collect();
        assert_eq!(versions, (1..=100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_durable_push_acknowledged_to_sender() {
        let room = room("empty");
        let (mut alice, mut alice_rx) = join(&room).await;
        let (_bob, mut bob_rx) = join(&room).await;

        let raw = push(PushKind::Durable, Vec::new());
        assert_eq!(alice.on_message(&raw).await, MessageOutcome::Acknowledged { increments: 0 });
        assert_eq!(next(&mut alice_rx), ServerMessage::acknowledged(Vec::new()));
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(room.log().get_last_version().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_block_pushes() {
        let room = Arc::new(Room::new(
            RoomId::parse("stalled").unwrap(),
            Arc::new(MemoryIncrementStore::new()),
            1,
        ));
        let (mut alice, mut alice_rx) = join(&room).await;
        let (stalled, _stalled_rx) = join(&room).await;
        let (mut carol, mut carol_rx) = join(&room).await;

        // Fills the stalled session's only slot
        let first = push(PushKind::Durable, vec![ClientIncrement::new("c1", "1")]);
        assert_eq!(carol.on_message(&first).await, MessageOutcome::Acknowledged { increments: 1 });
        carol_rx.recv().await.unwrap();
        alice_rx.recv().await.unwrap();

        let second = push(PushKind::Durable, vec![ClientIncrement::new("c2", "2")]);
        let outcome = tokio::time::timeout(Duration::from_secs(2), carol.on_message(&second))
            .await
            .expect("push must not wait on a stalled session");
        assert_eq!(outcome, MessageOutcome::Acknowledged { increments: 1 });
        assert!(!room.sessions().has_session(&stalled.id()).await);
        assert_eq!(room.sessions().stats().await.sessions_evicted, 1);
        carol_rx.recv().await.unwrap();
        alice_rx.recv().await.unwrap();

        // Later pushes from other sessions keep flowing
        let third = push(PushKind::Durable, vec![ClientIncrement::new("a1", "3")]);
        let outcome = tokio::time::timeout(Duration::from_secs(2), alice.on_message(&third))
            .await
            .expect("room push lock released");
        assert_eq!(outcome, MessageOutcome::Acknowledged { increments: 1 });
        assert_eq!(
            next(&mut carol_rx),
            ServerMessage::acknowledged(vec![ServerIncrement::new("a1", 3, "3")])
        );
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = room("small");
        let (_a, _rx) = ServerSession::connect(room.clone(), 1, TIMEOUT).await.unwrap();
        let result = ServerSession::connect(room.clone(), 1, TIMEOUT).await;
        assert!(matches!(result, Err(ServerError::RoomFull { limit: 1, .. })));
        assert_eq!(room.sessions().session_count().await, 1);
    }

    #[tokio::test]
    async fn test_chunk_flood_bounded_per_session() {
        let room = room("flood");
        let (session, _rx) = join(&room).await;
        let mut session = session.with_chunk_limits(ChunkLimits {
            max_pending_sets: 3,
            max_buffered_bytes: 1024,
        });

        // Many chunk ids, each left incomplete
        let mut dropped = 0;
        for _ in 0..10 {
            let envelopes = split_payload(MessageType::Relay, &format!("\"{}\"", "f".repeat(40)), 16);
            if session.on_message(&envelopes[0].encode().unwrap()).await == MessageOutcome::Dropped {
                dropped += 1;
            }
        }
        assert_eq!(session.pending_chunks(), 3);
        assert_eq!(dropped, 7);
    }

    #[tokio::test]
    async fn test_disconnect_abandons_partial_chunks() {
        let room = room("leave");
        let (mut session, _rx) = join(&room).await;

        let envelopes = split_payload(MessageType::Relay, &format!("\"{}\"", "r".repeat(100)), 16);
        session.on_message(&envelopes[0].encode().unwrap()).await;
        assert_eq!(session.pending_chunks(), 1);

        assert_eq!(session.disconnect().await, 1);
        assert_eq!(room.sessions().session_count().await, 0);
    }
}
