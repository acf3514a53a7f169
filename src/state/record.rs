use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

use crate::epic::Epic;
use crate::error::{EngineError, EngineResult};

/// Current persisted state schema version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Snapshot of an epic as written to durable storage.
///
/// The checksum covers the compact JSON of `epic` byte for byte as it is
/// stored, so verification never depends on re-serializing parsed values.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub schema_version: u32,
    /// Hex SHA-256 over the stored JSON of `epic`.
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    pub epic: Epic,
    epic_json: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordOut<'a> {
    schema_version: u32,
    checksum: &'a str,
    saved_at: &'a DateTime<Utc>,
    epic: &'a RawValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordIn<'a> {
    schema_version: u32,
    checksum: String,
    saved_at: DateTime<Utc>,
    #[serde(borrow)]
    epic: &'a RawValue,
}

impl PersistedState {
    /// Snapshot `epic` and stamp it with its checksum.
    pub fn seal(epic: &Epic) -> EngineResult<Self> {
        let epic_json = serde_json::to_string(epic)?;
        Ok(Self {
            schema_version: STATE_SCHEMA_VERSION,
            checksum: compute_checksum(epic_json.as_bytes()),
            saved_at: Utc::now(),
            epic: epic.clone(),
            epic_json,
        })
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        let epic = RawValue::from_string(self.epic_json.clone())?;
        let record = RecordOut {
            schema_version: self.schema_version,
            checksum: &self.checksum,
            saved_at: &self.saved_at,
            epic: &*epic,
        };
        Ok(serde_json::to_vec_pretty(&record)?)
    }

    /// Parse and verify a stored record. Unparseable content (a truncated
    /// write, for instance) is reported as corruption, not as a JSON error.
    pub fn from_bytes(bytes: &[u8], location: &Path) -> EngineResult<Self> {
        let corrupt = |reason: String| EngineError::CorruptState {
            location: location.to_path_buf(),
            reason,
        };
        let record: RecordIn<'_> = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(format!("unreadable state record: {e}")))?;

        if record.schema_version != STATE_SCHEMA_VERSION {
            return Err(corrupt(format!(
                "unsupported schema version {} (expected {})",
                record.schema_version, STATE_SCHEMA_VERSION
            )));
        }

        let epic_json = record.epic.get();
        let epic: Epic = serde_json::from_str(epic_json)
            .map_err(|e| corrupt(format!("unreadable epic: {e}")))?;
        let actual = compute_checksum(epic_json.as_bytes());
        if actual != record.checksum {
            return Err(corrupt(format!(
                "checksum mismatch at revision {}: stored {}, computed {}",
                epic.revision, record.checksum, actual
            )));
        }
        Ok(Self {
            schema_version: record.schema_version,
            checksum: record.checksum,
            saved_at: record.saved_at,
            epic,
            epic_json: epic_json.to_string(),
        })
    }
}

pub fn compute_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
