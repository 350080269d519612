//! Event-driven watcher backed by the platform's native notifications.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use dirsync_core::FileChangeEvent;
use notify::{recommended_watcher, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::detector::{canonical_root, DirectoryWatcher};
use crate::error::WatchError;
use crate::normalize::normalize;

/// Watches one directory (non-recursively) through `notify`.
pub struct NotifyWatcher {
    root: PathBuf,
    // Dropping the watcher stops the backend thread.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    /// An error seen while draining a batch, reported on the next call.
    pending_error: Option<notify::Error>,
}

impl NotifyWatcher {
    pub fn new(root: &Path) -> Result<Self, WatchError> {
        // Canonicalize so FSEvents paths (e.g. /private/var/... on macOS)
        // match the parent check in `normalize`.
        let root = canonical_root(root)?;

        let (tx, rx) = mpsc::channel();
        let mut watcher = recommended_watcher(tx)?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %root.display(), "watching directory (native notifications)");

        Ok(Self {
            root,
            _watcher: watcher,
            rx,
            pending_error: None,
        })
    }

    fn absorb(&mut self, event: notify::Result<Event>, batch: &mut Vec<FileChangeEvent>) {
        match event {
            Ok(event) if event.need_rescan() => {
                tracing::warn!(
                    root = %self.root.display(),
                    "notification buffer overflowed; changes in this interval were dropped",
                );
            }
            Ok(event) => batch.extend(normalize(&event, &self.root)),
            Err(err) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(err);
                }
            }
        }
    }
}

impl DirectoryWatcher for NotifyWatcher {
    fn root(&self) -> &Path {
        &self.root
    }

    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<FileChangeEvent>, WatchError> {
        if let Some(err) = self.pending_error.take() {
            return Err(err.into());
        }

        let first = match self.rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => return Err(WatchError::Disconnected),
        };

        let mut batch = Vec::new();
        self.absorb(first, &mut batch);
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.absorb(event, &mut batch),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if batch.is_empty() {
            if let Some(err) = self.pending_error.take() {
                return Err(err.into());
            }
        }
        Ok(batch)
    }
}
