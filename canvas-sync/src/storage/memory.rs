//! In-memory increment log with the same semantics as the RocksDB backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::rows::{assemble_rows, group_rows, now_millis, split_rows, IncrementRow, DEFAULT_MAX_ROW_BYTES};
use super::{IncrementRepository, StoreError};
use crate::protocol::{ClientIncrement, ServerIncrement, Version};

#[derive(Debug, Default)]
struct MemoryLog {
    /// Rows keyed by (version, position)
    rows: BTreeMap<(Version, u32), IncrementRow>,
    /// Uniqueness index
    ids: HashMap<String, Version>,
    last_version: Version,
}

impl MemoryLog {
    fn rows_at(&self, version: Version) -> Vec<IncrementRow> {
        self.rows
            .range((version, 0)..=(version, u32::MAX))
            .map(|(_, row)| row.clone())
            .collect()
    }
}

/// Volatile log for one room.
#[derive(Debug)]
pub struct MemoryIncrementStore {
    max_row_bytes: usize,
    log: Mutex<MemoryLog>,
}

impl MemoryIncrementStore {
    pub fn new() -> Self {
        Self::with_max_row_bytes(DEFAULT_MAX_ROW_BYTES)
    }

    pub fn with_max_row_bytes(max_row_bytes: usize) -> Self {
        Self {
            max_row_bytes,
            log: Mutex::new(MemoryLog::default()),
        }
    }

    /// Number of physical rows held.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.rows.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryLog>, StoreError> {
        self.log.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for MemoryIncrementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementRepository for MemoryIncrementStore {
    fn save_all(&self, increments: &[ClientIncrement]) -> Result<Vec<ServerIncrement>, StoreError> {
        let mut log = self.lock()?;
        let now = now_millis();

        let mut saved = Vec::with_capacity(increments.len());
        let mut staged: HashMap<&str, ServerIncrement> = HashMap::new();
        let mut staged_rows = Vec::new();
        let mut next_version = log.last_version;

        for increment in increments {
            if let Some(record) = staged.get(increment.id.as_str()) {
                saved.push(record.clone());
                continue;
            }
            if let Some(&version) = log.ids.get(&increment.id) {
                saved.push(assemble_rows(log.rows_at(version))?);
                continue;
            }

            next_version += 1;
            staged_rows.extend(split_rows(
                &increment.id,
                next_version,
                &increment.payload,
                self.max_row_bytes,
                now,
            ));
            let record = ServerIncrement::new(increment.id.clone(), next_version, increment.payload.clone());
            staged.insert(&increment.id, record.clone());
            saved.push(record);
        }

        // Commit only after every increment of the batch was staged
        for row in staged_rows {
            log.ids.insert(row.id.clone(), row.version);
            log.rows.insert((row.version, row.position), row);
        }
        log.last_version = next_version;

        Ok(saved)
    }

    fn get_since_version(&self, version: Version) -> Result<Vec<ServerIncrement>, StoreError> {
        let Some(start) = version.checked_add(1) else {
            return Ok(Vec::new());
        };
        let log = self.lock()?;
        group_rows(log.rows.range((start, 0)..).map(|(_, row)| row.clone()))
    }

    fn get_last_version(&self) -> Result<Version, StoreError> {
        Ok(self.lock()?.last_version)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<ServerIncrement>, StoreError> {
        let log = self.lock()?;
        match log.ids.get(id) {
            Some(&version) => assemble_rows(log.rows_at(version)).map(Some),
            None => Ok(None),
        }
    }
}
