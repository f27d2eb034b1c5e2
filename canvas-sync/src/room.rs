//! Rooms and the registry that owns them.
//!
//! A room pairs one increment log with one session set. Rooms are created
//! lazily on first connect and kept for the lifetime of the registry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::broadcast::SessionSet;
use crate::storage::{
    IncrementRepository, MemoryIncrementStore, RocksIncrementStore, StoreError, DEFAULT_MAX_ROW_BYTES,
};

/// Longest accepted room id.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// A validated room identifier: 1 to 128 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("Room id is empty")]
    Empty,
    #[error("Room id is {0} bytes long, at most {MAX_ROOM_ID_LEN} allowed")]
    TooLong(usize),
    #[error("Room id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.len() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong(raw.len()));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(RoomIdError::InvalidCharacter(c));
        }
        Ok(Self(raw.to_string()))
    }

    /// Extract the room id from the last segment of a request path such as
    /// `/rooms/<id>` or `/<id>?token=…`.
    pub fn from_path(path: &str) -> Result<Self, RoomIdError> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        Self::parse(segment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where room logs live.
#[derive(Clone)]
pub enum StorageBackend {
    /// Volatile logs, lost on restart.
    Memory { max_row_bytes: usize },
    /// One shared RocksDB store, one key range per room.
    Rocks(Arc<RocksIncrementStore>),
}

impl StorageBackend {
    pub fn memory() -> Self {
        StorageBackend::Memory {
            max_row_bytes: DEFAULT_MAX_ROW_BYTES,
        }
    }

    pub fn open_room(&self, id: &RoomId) -> Result<Arc<dyn IncrementRepository>, StoreError> {
        match self {
            StorageBackend::Memory { max_row_bytes } => {
                Ok(Arc::new(MemoryIncrementStore::with_max_row_bytes(*max_row_bytes)))
            }
            StorageBackend::Rocks(store) => Ok(Arc::new(store.room(id.as_str())?)),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, StorageBackend::Rocks(_))
    }
}

/// One collaborative document: its log, its sessions and its push lock.
pub struct Room {
    id: RoomId,
    sessions: SessionSet,
    log: Arc<dyn IncrementRepository>,
    /// Held across save-then-broadcast of durable pushes
    push_lock: Mutex<()>,
}

impl Room {
    pub fn new(id: RoomId, log: Arc<dyn IncrementRepository>, session_buffer: usize) -> Self {
        Self {
            id,
            sessions: SessionSet::new(session_buffer),
            log,
            push_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn log(&self) -> &dyn IncrementRepository {
        self.log.as_ref()
    }

    /// Serialize durable writes of this room.
    pub async fn lock_pushes(&self) -> MutexGuard<'_, ()> {
        self.push_lock.lock().await
    }
}

/// Maps room ids to rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    backend: StorageBackend,
    session_buffer: usize,
}

impl RoomRegistry {
    pub fn new(backend: StorageBackend, session_buffer: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            backend,
            session_buffer,
        }
    }

    /// Get the room, opening its log on first use.
    pub async fn get_or_create(&self, id: &RoomId) -> Result<Arc<Room>, StoreError> {
        if let Some(room) = self.rooms.read().await.get(id) {
            return Ok(room.clone());
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile
        if let Some(room) = rooms.get(id) {
            return Ok(room.clone());
        }

        let log = self.backend.open_room(id)?;
        let room = Arc::new(Room::new(id.clone(), log, self.session_buffer));
        rooms.insert(id.clone(), room.clone());
        log::info!("Opened room {id}");
        Ok(room)
    }

    pub async fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }
}
