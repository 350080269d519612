//! Status board: the process-wide sync status read by external tooling.
//!
//! Holds `{code, synced_files, last_file}` plus the latest diagnostic. The
//! dispatcher and transfer server write to it; nothing coordinates through
//! it. [`StatusBoard::persist`] mirrors a snapshot into a JSON file using the
//! same `.tmp` + rename pattern as every other write in the workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};

/// Lifecycle code reported on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    #[default]
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Point-in-time copy of the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub code: StatusCode,
    pub synced_files: u64,
    pub last_file: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            code: StatusCode::default(),
            synced_files: 0,
            last_file: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    status: SyncStatus,
    /// Bumped on every write so persisters can skip unchanged snapshots.
    revision: u64,
}

/// Cloneable handle to the shared status.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BoardState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.inner.read().status.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn set_code(&self, code: StatusCode) {
        self.update(|status| status.code = code);
    }

    /// Count one successfully synced file and remember its name.
    pub fn record_synced(&self, name: &str) {
        self.update(|status| {
            status.synced_files += 1;
            status.last_file = Some(name.to_string());
        });
    }

    /// Remember the latest failure diagnostic.
    pub fn record_failure(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|status| status.last_error = Some(message));
    }

    fn update(&self, apply: impl FnOnce(&mut SyncStatus)) {
        let mut state = self.inner.write();
        apply(&mut state.status);
        state.status.updated_at = Utc::now();
        state.revision += 1;
    }

    /// Write the current snapshot to `path` as pretty JSON.
    ///
    /// Writes to `<path>.tmp` then renames to `<path>`.
    pub fn persist(&self, path: &Path) -> Result<(), CoreError> {
        let snapshot = self.snapshot();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }

        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(path, e));
        }
        Ok(())
    }
}
