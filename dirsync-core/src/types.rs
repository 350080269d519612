//! Domain types for observed filesystem changes.
//!
//! Directory fields use `PathBuf`. Filenames are plain `String`s: they are
//! single path components, bounded to [`MAX_NAME_LEN`] bytes by the wire
//! format rather than by the type.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Longest filename, in bytes, that can travel in a transfer request.
pub const MAX_NAME_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One observed filesystem mutation, produced once by a watcher and
/// consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    /// Filename relative to `directory` (a single path component).
    pub name: String,
    /// The watch root the file lives in.
    pub directory: PathBuf,
    pub kind: ChangeKind,
}

impl FileChangeEvent {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            kind,
        }
    }

    /// Full local path of the changed file.
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

impl fmt::Display for FileChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path().display())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_path_joins_directory_and_name() {
        let event = FileChangeEvent::new("x.log", "/data", ChangeKind::Created);
        assert_eq!(event.path(), PathBuf::from("/data/x.log"));
    }

    #[test]
    fn event_display() {
        let event = FileChangeEvent::new("x.log", "/data", ChangeKind::Deleted);
        assert_eq!(event.to_string(), "deleted /data/x.log");
    }

    #[test]
    fn change_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&ChangeKind::Modified).expect("serialize");
        assert_eq!(json, "\"modified\"");
        let back: ChangeKind = serde_json::from_str("\"created\"").expect("deserialize");
        assert_eq!(back, ChangeKind::Created);
    }
}
