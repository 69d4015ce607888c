use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::{Result, SyncError};

/// Engine settings. Every field has a default, so a partial file works.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiescence window before document metadata is written back.
    pub persistence_debounce_ms: u64,

    /// Reload an active destination after a copy that failed without
    /// showing anything optimistically.
    pub reload_after_failed_copy: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            persistence_debounce_ms: 3000,
            reload_after_failed_copy: true,
        }
    }
}

impl SyncConfig {
    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    /// Reads a JSON config file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to read {}: {}", path.display(), e)))?;

        serde_json::from_str(&json)
            .map_err(|e| SyncError::Storage(format!("invalid config {}: {}", path.display(), e)))
    }
}
