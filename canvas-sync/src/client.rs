//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect + catch-up pull, disconnect, resume)
//! - Durable pushes held as pending until the server echoes them back
//! - Relay and ephemeral pushes for low-latency data
//! - Persistent `lastAcknowledgedVersion` per room
//!
//! Outbound messages larger than `max_chunk_bytes` are split into chunks.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::chunk::split_payload;
use crate::protocol::{
    ClientIncrement, ClientMessage, ProtocolError, PullPayload, PushKind, PushPayload, RelayPayload,
    ServerIncrement, ServerMessage, Version,
};
use crate::room::RoomId;

/// Default outbound chunk size (1.5MB).
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 1536 * 1024;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Sync state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sync state format error: {0}")]
    State(#[from] serde_json::Error),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub room_id: RoomId,
    /// Largest payload sent in one frame
    pub max_chunk_bytes: usize,
    /// Events buffered for the application
    pub event_buffer: usize,
    /// Where the sync state is persisted (None = memory only)
    pub state_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            server_url: server_url.into(),
            room_id,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            event_buffer: 256,
            state_path: None,
        }
    }

    /// WebSocket URL of the room.
    pub fn room_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_id)
    }
}

/// Sync progress persisted between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSyncState {
    pub room_id: String,
    pub last_acknowledged_version: Version,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ClientSyncState {
    /// In-memory state starting from version 0.
    pub fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_string(),
            last_acknowledged_version: 0,
            path: None,
        }
    }

    /// State persisted at `path`, loaded if the file exists.
    ///
    /// A file written for another room is ignored and overwritten on the
    /// next save.
    pub fn with_path(path: PathBuf, room_id: &RoomId) -> Result<Self, ClientError> {
        let mut state = Self::new(room_id);
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let stored: ClientSyncState = serde_json::from_str(&json)?;
            if stored.room_id == state.room_id {
                state.last_acknowledged_version = stored.last_acknowledged_version;
            } else {
                log::warn!(
                    "Sync state at {} belongs to room {}, starting room {} from scratch",
                    path.display(),
                    stored.room_id,
                    state.room_id
                );
            }
        }
        state.path = Some(path);
        Ok(state)
    }

    /// Save state to disk
    pub fn save(&self) -> Result<(), ClientError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Relay or ephemeral push from another session
    Relayed(RelayPayload),
    /// Versioned increments, in version order
    Acknowledged {
        /// Increments from other clients, to apply locally
        increments: Vec<ServerIncrement>,
        /// Own pending increments now persisted
        confirmed: Vec<ServerIncrement>,
        last_acknowledged_version: Version,
    },
    /// A durable push the server failed to persist
    Rejected {
        increments: Vec<ClientIncrement>,
        message: String,
    },
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Local view of the room's log.
///
/// Increments are applied at most once (deduplicated by id), and
/// `lastAcknowledgedVersion` only advances over a gap-free prefix of
/// versions, so a pull after reconnect never skips an increment that was
/// missed while an out-of-order acknowledgement arrived.
#[derive(Debug)]
pub struct Replica {
    state: ClientSyncState,
    /// Ids already applied or confirmed
    known: HashSet<String>,
    /// Received versions above the contiguous prefix
    ahead: BTreeSet<Version>,
    /// Own durable increments awaiting a version, in submission order
    pending: Vec<ClientIncrement>,
}

impl Replica {
    pub fn new(state: ClientSyncState) -> Self {
        Self {
            state,
            known: HashSet::new(),
            ahead: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn last_acknowledged_version(&self) -> Version {
        self.state.last_acknowledged_version
    }

    pub fn pending(&self) -> &[ClientIncrement] {
        &self.pending
    }

    /// Track durable increments until the server versions them.
    pub fn record_pending(&mut self, increments: &[ClientIncrement]) {
        for increment in increments {
            let queued = self.pending.iter().any(|p| p.id == increment.id);
            if !queued && !self.known.contains(&increment.id) {
                self.pending.push(increment.clone());
            }
        }
    }

    /// Apply one server message, returning the event for the application.
    pub fn handle(&mut self, message: ServerMessage) -> Option<SyncEvent> {
        match message {
            ServerMessage::Relayed(payload) => Some(SyncEvent::Relayed(payload)),
            ServerMessage::Acknowledged(ack) => Some(self.acknowledge(ack.increments)),
            ServerMessage::Rejected(rejected) => {
                let ids: HashSet<&str> = rejected.increments.iter().map(|i| i.id.as_str()).collect();
                self.pending.retain(|p| !ids.contains(p.id.as_str()));
                log::warn!(
                    "Server rejected {} increments: {}",
                    rejected.increments.len(),
                    rejected.message
                );
                Some(SyncEvent::Rejected {
                    increments: rejected.increments,
                    message: rejected.message,
                })
            }
        }
    }

    fn acknowledge(&mut self, mut increments: Vec<ServerIncrement>) -> SyncEvent {
        increments.sort_by_key(|inc| inc.version);

        let mut remote = Vec::new();
        let mut confirmed = Vec::new();
        for increment in increments {
            self.advance(increment.version);
            let was_pending = match self.pending.iter().position(|p| p.id == increment.id) {
                Some(index) => {
                    self.pending.remove(index);
                    true
                }
                None => false,
            };
            let fresh = self.known.insert(increment.id.clone());
            if was_pending {
                confirmed.push(increment);
            } else if fresh {
                remote.push(increment);
            }
        }

        if let Err(e) = self.state.save() {
            log::warn!("Failed to persist sync state: {e}");
        }

        SyncEvent::Acknowledged {
            increments: remote,
            confirmed,
            last_acknowledged_version: self.state.last_acknowledged_version,
        }
    }

    fn advance(&mut self, version: Version) {
        if version <= self.state.last_acknowledged_version {
            return;
        }
        self.ahead.insert(version);
        while self.ahead.remove(&(self.state.last_acknowledged_version + 1)) {
            self.state.last_acknowledged_version += 1;
        }
    }
}

/// The sync client.
///
/// Owns one WebSocket connection to one room and reports everything the
/// server sends as [`SyncEvent`]s.
pub struct SyncClient {
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    replica: Arc<Mutex<Replica>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    reader: Option<JoinHandle<()>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client, loading persisted sync state if configured.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let sync_state = match &config.state_path {
            Some(path) => ClientSyncState::with_path(path.clone(), &config.room_id)?,
            None => ClientSyncState::new(&config.room_id),
        };
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(Mutex::new(Replica::new(sync_state))),
            outgoing_tx: None,
            reader: None,
            event_rx: Some(event_rx),
            event_tx,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, pull everything newer than the last acknowledged version and
    /// resend pending durable increments.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_connected().await {
            return Ok(());
        }
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.config.room_url();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames, close the socket when the channel closes
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // The reader may observe a close right away; it must be the last to set the state
        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: feed server messages through the replica
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(message) => {
                            let event = replica.lock().await.handle(message);
                            if let Some(event) = event {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Dropping malformed server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.reader = Some(reader);
        log::info!("Connected to {url}");

        self.pull().await?;

        let pending = self.replica.lock().await.pending().to_vec();
        if !pending.is_empty() {
            log::info!("Replaying {} pending increments", pending.len());
            self.send(&ClientMessage::Push(PushPayload {
                kind: PushKind::Durable,
                increments: pending,
            }))
            .await?;
        }

        Ok(())
    }

    /// Request every increment newer than the last acknowledged version.
    pub async fn pull(&self) -> Result<(), ClientError> {
        let last_acknowledged_version = self.last_acknowledged_version().await;
        self.send(&ClientMessage::Pull(PullPayload {
            last_acknowledged_version,
        }))
        .await
    }

    /// Push increments.
    ///
    /// Durable increments stay pending until acknowledged and are resent on
    /// the next connect if the client is offline. Ephemeral increments sent
    /// while offline are dropped.
    pub async fn push(&self, increments: Vec<ClientIncrement>, kind: PushKind) -> Result<(), ClientError> {
        if increments.is_empty() {
            return Ok(());
        }
        if kind == PushKind::Durable {
            self.replica.lock().await.record_pending(&increments);
        }
        if !self.is_connected().await {
            log::debug!("Offline: {} {kind:?} increments not sent", increments.len());
            return Ok(());
        }

        match self.send(&ClientMessage::Push(PushPayload { kind, increments })).await {
            Err(ClientError::NotConnected) if kind == PushKind::Durable => Ok(()),
            result => result,
        }
    }

    /// Fire-and-forget relay to the other sessions of the room.
    pub async fn relay(&self, payload: RelayPayload) -> Result<(), ClientError> {
        if !self.is_connected().await {
            log::debug!("Offline: relay dropped");
            return Ok(());
        }
        self.send(&ClientMessage::Relay(payload)).await
    }

    /// Close the connection. A later [`connect`](Self::connect) resumes from
    /// the persisted version.
    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // Dropping the sender lets the writer close the socket
        self.outgoing_tx = None;

        let was_connected = {
            let mut state = self.state.write().await;
            let was = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        }

        if let Err(e) = self.replica.lock().await.state.save() {
            log::warn!("Failed to persist sync state: {e}");
        }
    }

    /// Encode, chunk and queue one message.
    async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let payload = message.encode_payload()?;
        for envelope in split_payload(message.message_type(), &payload, self.config.max_chunk_bytes) {
            tx.send(envelope.encode()?)
                .await
                .map_err(|_| ClientError::NotConnected)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub async fn last_acknowledged_version(&self) -> Version {
        self.replica.lock().await.last_acknowledged_version()
    }

    /// Durable increments not yet acknowledged.
    pub async fn pending_len(&self) -> usize {
        self.replica.lock().await.pending().len()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.config.room_id
    }
}
