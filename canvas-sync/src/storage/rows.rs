//! Fixed-size row chunking for stored payloads.
//!
//! An increment is stored as `count` rows, each holding at most
//! `max_row_bytes` payload bytes. Rows are read back ordered by
//! `(version, position)` and concatenated only when the set is complete.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::protocol::{ServerIncrement, Version};

/// Default maximum payload bytes per stored row (1MB).
pub const DEFAULT_MAX_ROW_BYTES: usize = 1024 * 1024;

/// One physical row of a stored increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRow {
    pub id: String,
    pub version: Version,
    pub position: u32,
    pub count: u32,
    /// Milliseconds since the epoch
    pub created_at: u64,
    pub fragment: Vec<u8>,
}

/// Split a payload into rows. An empty payload still yields one row.
pub fn split_rows(
    id: &str,
    version: Version,
    payload: &str,
    max_row_bytes: usize,
    created_at: u64,
) -> Vec<IncrementRow> {
    let bytes = payload.as_bytes();
    if bytes.is_empty() {
        return vec![IncrementRow {
            id: id.to_string(),
            version,
            position: 0,
            count: 1,
            created_at,
            fragment: Vec::new(),
        }];
    }

    let fragments: Vec<&[u8]> = bytes.chunks(max_row_bytes.max(1)).collect();
    let count = fragments.len() as u32;
    fragments
        .into_iter()
        .enumerate()
        .map(|(position, fragment)| IncrementRow {
            id: id.to_string(),
            version,
            position: position as u32,
            count,
            created_at,
            fragment: fragment.to_vec(),
        })
        .collect()
}

/// Reassemble the rows of one increment.
pub fn assemble_rows(mut rows: Vec<IncrementRow>) -> Result<ServerIncrement, StoreError> {
    let Some(first) = rows.first() else {
        return Err(StoreError::Corrupt {
            id: String::new(),
            details: "no rows".into(),
        });
    };
    let id = first.id.clone();
    let version = first.version;
    let count = first.count;

    let corrupt = |details: String| StoreError::Corrupt {
        id: id.clone(),
        details,
    };

    if rows.len() != count as usize {
        return Err(corrupt(format!("expected {count} rows, found {}", rows.len())));
    }

    rows.sort_by_key(|row| (row.position, row.created_at));

    let mut bytes = Vec::with_capacity(rows.iter().map(|r| r.fragment.len()).sum());
    for (expected, row) in rows.into_iter().enumerate() {
        if row.id != id || row.version != version || row.count != count {
            return Err(corrupt(format!("row {} belongs to another increment", row.position)));
        }
        if row.position != expected as u32 {
            return Err(corrupt(format!("missing row {expected}")));
        }
        bytes.extend_from_slice(&row.fragment);
    }

    let payload = String::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
    Ok(ServerIncrement {
        id,
        version,
        payload,
    })
}

/// Reassemble increments from rows sorted by version.
pub fn group_rows(
    rows: impl IntoIterator<Item = IncrementRow>,
) -> Result<Vec<ServerIncrement>, StoreError> {
    let mut increments = Vec::new();
    let mut current: Vec<IncrementRow> = Vec::new();

    for row in rows {
        if current.first().is_some_and(|first| first.version != row.version) {
            increments.push(assemble_rows(std::mem::take(&mut current))?);
        }
        current.push(row);
    }
    if !current.is_empty() {
        increments.push(assemble_rows(current)?);
    }

    Ok(increments)
}

/// Milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
