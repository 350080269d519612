//! Poll-and-diff watcher.
//!
//! Some platforms only signal that *something* in a directory changed. This
//! watcher recovers name and operation by listing the root on every poll and
//! diffing the listing against the previous one:
//!
//! - name only in the new listing → `Created`
//! - name only in the old listing → `Deleted`
//! - name in both with a different length or mtime → `Modified`
//!
//! A batch lists deletions first, then creations, then modifications, each
//! group in filename order, so a rename reads as delete-then-create. A file
//! rewritten with identical length within the filesystem's mtime
//! granularity is not seen.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use dirsync_core::{ChangeKind, FileChangeEvent};

use crate::detector::{canonical_root, DirectoryWatcher};
use crate::error::{io_err, WatchError};

/// What the differ compares per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Regular files directly under one directory, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, FileStamp>,
}

impl Snapshot {
    /// List the regular files of `root`. Entries that vanish mid-listing are
    /// skipped; failing to read `root` itself is an error.
    pub fn capture(root: &Path) -> Result<Self, WatchError> {
        let mut entries = BTreeMap::new();
        let dir = fs::read_dir(root).map_err(|e| io_err(root, e))?;
        for entry in dir {
            let entry = entry.map_err(|e| io_err(root, e))?;
            let path = entry.path();
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!(path = %path.display(), "skipping non UTF-8 filename");
                continue;
            };
            entries.insert(
                name,
                FileStamp {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FileStamp> {
        self.entries.get(name)
    }

    /// Events that turn `self` into `after`, attributed to `directory`.
    pub fn diff(&self, after: &Snapshot, directory: &Path) -> Vec<FileChangeEvent> {
        let deleted = self
            .entries
            .keys()
            .filter(|name| !after.entries.contains_key(*name))
            .map(|name| FileChangeEvent::new(name.as_str(), directory, ChangeKind::Deleted));

        let created = after
            .entries
            .keys()
            .filter(|name| !self.entries.contains_key(*name))
            .map(|name| FileChangeEvent::new(name.as_str(), directory, ChangeKind::Created));

        let modified = after
            .entries
            .iter()
            .filter(|(name, stamp)| {
                self.entries
                    .get(*name)
                    .is_some_and(|before| before != *stamp)
            })
            .map(|(name, _)| FileChangeEvent::new(name.as_str(), directory, ChangeKind::Modified));

        deleted.chain(created).chain(modified).collect()
    }
}

/// Watcher that rescans the root every `interval`.
pub struct SnapshotWatcher {
    root: PathBuf,
    interval: Duration,
    last: Snapshot,
    next_scan: Instant,
}

impl SnapshotWatcher {
    /// Take the baseline listing. Files already present are not reported.
    pub fn new(root: &Path, interval: Duration) -> Result<Self, WatchError> {
        let root = canonical_root(root)?;
        let last = Snapshot::capture(&root)?;
        tracing::debug!(
            path = %root.display(),
            files = last.len(),
            interval_ms = interval.as_millis() as u64,
            "watching directory (snapshot polling)",
        );
        Ok(Self {
            root,
            interval,
            last,
            next_scan: Instant::now() + interval,
        })
    }
}

impl DirectoryWatcher for SnapshotWatcher {
    fn root(&self) -> &Path {
        &self.root
    }

    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<FileChangeEvent>, WatchError> {
        let now = Instant::now();
        if now < self.next_scan {
            thread::sleep((self.next_scan - now).min(timeout));
            if Instant::now() < self.next_scan {
                return Ok(Vec::new());
            }
        }

        let current = Snapshot::capture(&self.root)?;
        let events = self.last.diff(&current, &self.root);
        self.last = current;
        self.next_scan = Instant::now() + self.interval;
        Ok(events)
    }
}
