//! RocksDB-backed increment log.
//!
//! Column families:
//! - `increments`: payload rows, key `<room><version:8 BE><position:4 BE>`,
//!   value bincode row with an LZ4-compressed fragment
//! - `ids`: uniqueness index, key `<room><id>`, value version (8 BE)
//! - `rooms`: room metadata, key `<room>`, value bincode [`RoomMetadata`]
//!
//! `<room>` is the room id prefixed with its length (2 bytes BE), so one
//! room's keys never interleave with another's and a forward scan from
//! `<room><version>` yields rows in `(version, position)` order.
//!
//! All rows of a batch, their id entries and the updated room metadata go
//! into a single `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::rows::{assemble_rows, group_rows, now_millis, split_rows, IncrementRow, DEFAULT_MAX_ROW_BYTES};
use super::{IncrementRepository, StoreError};
use crate::protocol::{ClientIncrement, ServerIncrement, Version};

/// Column family names.
const CF_INCREMENTS: &str = "increments";
const CF_IDS: &str = "ids";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_INCREMENTS, CF_IDS, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
    /// Maximum payload bytes per stored row (default: 1MB)
    pub max_row_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_sync_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
            max_row_bytes: DEFAULT_MAX_ROW_BYTES,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, small rows).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            max_row_bytes: 4 * 1024,
        }
    }
}

/// Per-room metadata, written on first open and on every save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Version of the newest increment (0 = empty)
    pub last_version: Version,
    pub increment_count: u64,
    /// Physical rows, >= increment_count when payloads are split
    pub row_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_secs();
        Self {
            room_id: room_id.to_string(),
            last_version: 0,
            increment_count: 0,
            row_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Row value; version and position live in the key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    id: String,
    count: u32,
    created_at: u64,
    compressed: Vec<u8>,
}

impl StoredRow {
    fn encode(row: &IncrementRow) -> Result<Vec<u8>, StoreError> {
        let stored = StoredRow {
            id: row.id.clone(),
            count: row.count,
            created_at: row.created_at,
            compressed: lz4_flex::compress_prepend_size(&row.fragment),
        };
        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(version: Version, position: u32, bytes: &[u8]) -> Result<IncrementRow, StoreError> {
        let (stored, _): (StoredRow, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let fragment = lz4_flex::decompress_size_prepended(&stored.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(IncrementRow {
            id: stored.id,
            version,
            position,
            count: stored.count,
            created_at: stored.created_at,
            fragment,
        })
    }
}

/// Key prefix for one room.
#[derive(Debug, Clone)]
struct RoomKey {
    room_id: String,
    prefix: Vec<u8>,
}

impl RoomKey {
    fn new(room_id: &str) -> Result<Self, StoreError> {
        let len = u16::try_from(room_id.len())
            .map_err(|_| StoreError::Database(format!("Room id too long: {} bytes", room_id.len())))?;
        let mut prefix = Vec::with_capacity(2 + room_id.len());
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(room_id.as_bytes());
        Ok(Self {
            room_id: room_id.to_string(),
            prefix,
        })
    }

    /// `<room><version:8 BE><position:4 BE>`
    fn row_key(&self, version: Version, position: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 12);
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&version.to_be_bytes());
        key.extend_from_slice(&position.to_be_bytes());
        key
    }

    /// `<room><id>`
    fn id_key(&self, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + id.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Split a row key of this room into (version, position).
    fn parse_row_key(&self, key: &[u8]) -> Option<(Version, u32)> {
        let rest = key.strip_prefix(self.prefix.as_slice())?;
        if rest.len() != 12 {
            return None;
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&rest[..8]);
        let mut position = [0u8; 4];
        position.copy_from_slice(&rest[8..]);
        Some((u64::from_be_bytes(version), u32::from_be_bytes(position)))
    }
}

/// RocksDB increment store shared by every room of a host.
///
/// Use [`RocksIncrementStore::room`] to get the per-room log.
pub struct RocksIncrementStore {
    /// RocksDB instance (single-threaded mode, writes serialized per room)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// One lock per room for the read-check-write sequence of saves.
    /// Rooms never wait on each other.
    room_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RocksIncrementStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened increment store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            room_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_INCREMENTS => {
                // Fragments are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_IDS | CF_ROOMS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Open the log of one room, registering the room on first use.
    pub fn room(self: &Arc<Self>, room_id: &str) -> Result<RocksRoomLog, StoreError> {
        let room = RoomKey::new(room_id)?;
        let write_lock = self.room_lock(room_id)?;
        {
            let _guard = write_lock.lock().map_err(|_| StoreError::Poisoned)?;
            if self.metadata(&room)?.is_none() {
                let cf = self.cf(CF_ROOMS)?;
                self.db.put_cf(&cf, &room.prefix, RoomMetadata::new(room_id).encode()?)?;
                log::info!("Registered room {room_id}");
            }
        }
        Ok(RocksRoomLog {
            store: self.clone(),
            room,
            write_lock,
        })
    }

    /// The write lock shared by every log handle of `room_id`.
    fn room_lock(&self, room_id: &str) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self.room_locks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(locks.entry(room_id.to_string()).or_default().clone())
    }

    /// All rooms ever opened on this store.
    pub fn list_rooms(&self) -> Result<Vec<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(RoomMetadata::decode(&value)?);
        }
        Ok(rooms)
    }

    /// Metadata for a room, if it was ever opened.
    pub fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        self.metadata(&RoomKey::new(room_id)?)
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ─── Per-room operations ──────────────────────────────────────────

    /// Caller holds the room's write lock.
    fn save_all_in(
        &self,
        room: &RoomKey,
        increments: &[ClientIncrement],
    ) -> Result<Vec<ServerIncrement>, StoreError> {
        let cf_rows = self.cf(CF_INCREMENTS)?;
        let cf_ids = self.cf(CF_IDS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let mut meta = self
            .metadata(room)?
            .unwrap_or_else(|| RoomMetadata::new(&room.room_id));
        let now = now_millis();

        let mut batch = WriteBatch::default();
        let mut saved = Vec::with_capacity(increments.len());
        let mut staged: HashMap<&str, ServerIncrement> = HashMap::new();

        for increment in increments {
            if let Some(record) = staged.get(increment.id.as_str()) {
                saved.push(record.clone());
                continue;
            }
            if let Some(existing) = self.get_by_id_in(room, &increment.id)? {
                log::debug!(
                    "Increment {} already stored at version {} in room {}",
                    existing.id,
                    existing.version,
                    room.room_id
                );
                saved.push(existing);
                continue;
            }

            let version = meta.last_version + 1;
            let rows = split_rows(
                &increment.id,
                version,
                &increment.payload,
                self.config.max_row_bytes,
                now,
            );
            for row in &rows {
                batch.put_cf(&cf_rows, room.row_key(version, row.position), StoredRow::encode(row)?);
            }
            batch.put_cf(&cf_ids, room.id_key(&increment.id), version.to_be_bytes());

            meta.last_version = version;
            meta.increment_count += 1;
            meta.row_count += rows.len() as u64;

            let record = ServerIncrement::new(increment.id.clone(), version, increment.payload.clone());
            staged.insert(&increment.id, record.clone());
            saved.push(record);
        }

        if !staged.is_empty() {
            meta.updated_at = now_secs();
            batch.put_cf(&cf_rooms, &room.prefix, meta.encode()?);

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            self.db.write_opt(batch, &write_opts)?;
        }

        Ok(saved)
    }

    fn get_since_in(&self, room: &RoomKey, version: Version) -> Result<Vec<ServerIncrement>, StoreError> {
        let Some(start) = version.checked_add(1) else {
            return Ok(Vec::new());
        };
        let rows = self.scan_rows(room, start, None)?;
        group_rows(rows)
    }

    fn get_by_id_in(&self, room: &RoomKey, id: &str) -> Result<Option<ServerIncrement>, StoreError> {
        let cf = self.cf(CF_IDS)?;
        let Some(bytes) = self.db.get_cf(&cf, room.id_key(id))? else {
            return Ok(None);
        };
        let version_bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            id: id.to_string(),
            details: format!("id index holds {} bytes", bytes.len()),
        })?;
        let version = u64::from_be_bytes(version_bytes);

        let rows = self.scan_rows(room, version, Some(version))?;
        if rows.is_empty() {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                details: format!("indexed at version {version} but no rows stored"),
            });
        }
        assemble_rows(rows).map(Some)
    }

    /// Rows of a room from version `from` (inclusive), optionally up to `until`.
    fn scan_rows(
        &self,
        room: &RoomKey,
        from: Version,
        until: Option<Version>,
    ) -> Result<Vec<IncrementRow>, StoreError> {
        let cf = self.cf(CF_INCREMENTS)?;
        let start_key = room.row_key(from, 0);

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;

            // Stop once past this room's key range
            let Some((version, position)) = room.parse_row_key(&key) else {
                break;
            };
            if until.is_some_and(|last| version > last) {
                break;
            }
            rows.push(StoredRow::decode(version, position, &value)?);
        }

        Ok(rows)
    }

    fn metadata(&self, room: &RoomKey) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, &room.prefix)? {
            Some(bytes) => RoomMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

/// The increment log of one room inside a [`RocksIncrementStore`].
#[derive(Clone)]
pub struct RocksRoomLog {
    store: Arc<RocksIncrementStore>,
    room: RoomKey,
    write_lock: Arc<Mutex<()>>,
}

impl RocksRoomLog {
    pub fn room_id(&self) -> &str {
        &self.room.room_id
    }

    pub fn metadata(&self) -> Result<Option<RoomMetadata>, StoreError> {
        self.store.metadata(&self.room)
    }
}

impl IncrementRepository for RocksRoomLog {
    fn save_all(&self, increments: &[ClientIncrement]) -> Result<Vec<ServerIncrement>, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.store.save_all_in(&self.room, increments)
    }

    fn get_since_version(&self, version: Version) -> Result<Vec<ServerIncrement>, StoreError> {
        self.store.get_since_in(&self.room, version)
    }

    fn get_last_version(&self) -> Result<Version, StoreError> {
        Ok(self.metadata()?.map_or(0, |meta| meta.last_version))
    }

    fn get_by_id(&self, id: &str) -> Result<Option<ServerIncrement>, StoreError> {
        self.store.get_by_id_in(&self.room, id)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<RocksIncrementStore> {
        Arc::new(RocksIncrementStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.path().exists());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_idempotent_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        testing::check_idempotent_save(&store.room("room-a").unwrap());
    }

    #[test]
    fn test_total_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        testing::check_total_order(&store.room("room-a").unwrap());
    }

    #[test]
    fn test_batch_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        testing::check_batch(&store.room("room-a").unwrap());
    }

    #[test]
    fn test_large_payload_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let log = store.room("room-a").unwrap();
        testing::check_large_payload(&log, store.config().max_row_bytes);

        let meta = log.metadata().unwrap().unwrap();
        assert_eq!(meta.increment_count, 2);
        assert_eq!(meta.row_count, 5);
    }

    #[test]
    fn test_room_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // "ab" + "c…" must not collide with "a" + "bc…" thanks to the length prefix
        let a = store.room("a").unwrap();
        let ab = store.room("ab").unwrap();

        for i in 0..5 {
            a.save(&ClientIncrement::new(format!("a{i}"), "x")).unwrap();
        }
        ab.save(&ClientIncrement::new("a0", "other room")).unwrap();

        assert_eq!(a.get_last_version().unwrap(), 5);
        assert_eq!(ab.get_last_version().unwrap(), 1);
        assert_eq!(a.get_since_version(0).unwrap().len(), 5);
        assert_eq!(ab.get_by_id("a0").unwrap().unwrap().payload, "other room");
        assert!(ab.get_by_id("a1").unwrap().is_none());

        let mut rooms: Vec<String> = store.list_rooms().unwrap().into_iter().map(|m| m.room_id).collect();
        rooms.sort();
        assert_eq!(rooms, vec!["a", "ab"]);
    }

    #[test]
    fn test_reopen_preserves_log() {
        let dir = tempfile::tempdir().unwrap();
        let big = "q".repeat(10_000);
        {
            let store = open_store(&dir);
            let log = store.room("persist").unwrap();
            log.save(&ClientIncrement::new("one", "1")).unwrap();
            log.save(&ClientIncrement::new("two", big.clone())).unwrap();
            store.flush().unwrap();
        }

        let store = open_store(&dir);
        let log = store.room("persist").unwrap();
        assert_eq!(log.get_last_version().unwrap(), 2);
        assert_eq!(log.get_by_id("two").unwrap().unwrap().payload, big);

        // Ids survive the restart too
        let retry = log.save(&ClientIncrement::new("one", "again")).unwrap();
        assert_eq!(retry, ServerIncrement::new("one", 1, "1"));
        let next = log.save(&ClientIncrement::new("three", "3")).unwrap();
        assert_eq!(next.version, 3);
    }

    #[test]
    fn test_concurrent_duplicate_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let log = store.room("race").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    let shared = log.save(&ClientIncrement::new("shared", "s")).unwrap();
                    log.save(&ClientIncrement::new(format!("own-{i}"), "o")).unwrap();
                    shared
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), ServerIncrement::new("shared", 1, "s"));
        }
        let versions: Vec<Version> = log
            .get_since_version(0)
            .unwrap()
            .iter()
            .map(|inc| inc.version)
            .collect();
        assert_eq!(versions, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_rooms_write_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let busy = store.room("busy").unwrap();
        let idle = store.room("idle").unwrap();

        // Handles of one room share its lock; other rooms have their own
        assert!(Arc::ptr_eq(&busy.write_lock, &store.room("busy").unwrap().write_lock));
        assert!(!Arc::ptr_eq(&busy.write_lock, &idle.write_lock));

        // A save in progress in "busy" must not hold up "idle"
        let held = busy.write_lock.lock().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let writer = std::thread::spawn(move || {
            tx.send(idle.save(&ClientIncrement::new("i1", "x")).unwrap()).unwrap();
        });
        let saved = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("save in another room completes while this one is locked");
        assert_eq!(saved, ServerIncrement::new("i1", 1, "x"));
        writer.join().unwrap();
        drop(held);

        assert_eq!(busy.save(&ClientIncrement::new("b1", "y")).unwrap().version, 1);
    }

    #[test]
    fn test_room_id_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.room(&"r".repeat(70_000)).is_err());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.max_row_bytes, DEFAULT_MAX_ROW_BYTES);
        assert!(!config.sync_writes);
    }
}
