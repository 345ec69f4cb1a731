use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// One versioned entry in the shared blackboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStateEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Optimistically versioned key/value state shared across agents.
///
/// Writers pass the version they read; a mismatch means another writer got
/// there first and the caller must re-read before retrying. Version 0 is
/// the expected version for creation.
#[derive(Default)]
pub struct SharedStateManager {
    entries: RwLock<HashMap<String, SharedStateEntry>>,
}

impl SharedStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<SharedStateEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Compare-and-set. Returns the new version on success.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
        updated_by: &str,
    ) -> ConveyorResult<u64> {
        let mut entries = self.entries.write().await;
        let actual = entries.get(key).map_or(0, |e| e.version);
        if actual != expected_version {
            return Err(ConveyorError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        entries.insert(
            key.to_string(),
            SharedStateEntry {
                key: key.to_string(),
                value,
                version,
                updated_by: updated_by.to_string(),
                updated_at: Utc::now(),
            },
        );
        debug!(key, version, updated_by, "shared state written");
        Ok(version)
    }

    /// Versioned delete, same discipline as [`set`](Self::set).
    pub async fn delete(&self, key: &str, expected_version: u64) -> ConveyorResult<()> {
        let mut entries = self.entries.write().await;
        let actual = entries.get(key).map_or(0, |e| e.version);
        if actual != expected_version {
            return Err(ConveyorError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        entries.remove(key);
        Ok(())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}
