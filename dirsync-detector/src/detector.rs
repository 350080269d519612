use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirsync_core::{EventQueue, FileChangeEvent, WatchMode};
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, WatchError};
use crate::notify_watcher::NotifyWatcher;
use crate::snapshot::SnapshotWatcher;

/// A source of normalized change events for one watch root.
pub trait DirectoryWatcher: Send {
    /// The directory being watched.
    fn root(&self) -> &Path;

    /// Wait at most `timeout` for the next batch of changes.
    ///
    /// Returns an empty batch when nothing happened in time.
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<FileChangeEvent>, WatchError>;
}

/// Drives a [`DirectoryWatcher`] and feeds the event queue.
pub struct ChangeDetector {
    watcher: Box<dyn DirectoryWatcher>,
}

impl ChangeDetector {
    /// Start watching `root` with the strategy selected by `mode`.
    pub fn watch(root: &Path, mode: WatchMode, poll_interval: Duration) -> Result<Self, WatchError> {
        let watcher: Box<dyn DirectoryWatcher> = match mode {
            WatchMode::Event => Box::new(NotifyWatcher::new(root)?),
            WatchMode::Poll => Box::new(SnapshotWatcher::new(root, poll_interval)?),
        };
        tracing::info!(root = %watcher.root().display(), mode = %mode, "change detector ready");
        Ok(Self { watcher })
    }

    pub fn with_watcher(watcher: Box<dyn DirectoryWatcher>) -> Self {
        Self { watcher }
    }

    pub fn root(&self) -> &Path {
        self.watcher.root()
    }

    /// Pump events into `queue` until `stop` is cancelled.
    ///
    /// Every wait is bounded by `tick`, so cancellation is observed within
    /// one tick even while the queue is full. A watcher error ends the loop
    /// and is returned to the caller.
    pub fn run(
        &mut self,
        queue: &EventQueue<FileChangeEvent>,
        stop: &CancellationToken,
        tick: Duration,
    ) -> Result<(), WatchError> {
        tracing::info!(root = %self.root().display(), "change detector running");
        while !stop.is_cancelled() {
            let batch = self.watcher.next_batch(tick)?;
            let total = batch.len();
            for (delivered, event) in batch.into_iter().enumerate() {
                tracing::debug!(name = %event.name, kind = %event.kind, "file event");
                if !enqueue_until_stopped(queue, event, stop, tick) {
                    tracing::debug!(
                        dropped = total - delivered,
                        "stopped while queue was full; discarding remaining events",
                    );
                    return Ok(());
                }
            }
        }
        tracing::info!(root = %self.root().display(), "change detector stopped");
        Ok(())
    }
}

/// Block on a full queue one tick at a time. Returns `false` if `stop` was
/// cancelled before a slot freed up.
fn enqueue_until_stopped(
    queue: &EventQueue<FileChangeEvent>,
    mut event: FileChangeEvent,
    stop: &CancellationToken,
    tick: Duration,
) -> bool {
    loop {
        match queue.enqueue_timeout(event, tick) {
            Ok(()) => return true,
            Err(back) => {
                if stop.is_cancelled() {
                    return false;
                }
                tracing::debug!(capacity = queue.capacity(), "event queue full; waiting for dispatcher");
                event = back;
            }
        }
    }
}

/// Validate the watch root and resolve symlinks.
pub(crate) fn canonical_root(root: &Path) -> Result<PathBuf, WatchError> {
    let meta = match fs::metadata(root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(WatchError::RootMissing {
                path: root.to_path_buf(),
            })
        }
        Err(err) => return Err(io_err(root, err)),
    };
    if !meta.is_dir() {
        return Err(WatchError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    fs::canonicalize(root).map_err(|e| io_err(root, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::ChangeKind;
    use std::collections::VecDeque;

    /// Replays canned batches, then reports an error.
    struct Scripted {
        root: PathBuf,
        batches: VecDeque<Vec<FileChangeEvent>>,
    }

    impl DirectoryWatcher for Scripted {
        fn root(&self) -> &Path {
            &self.root
        }

        fn next_batch(&mut self, _timeout: Duration) -> Result<Vec<FileChangeEvent>, WatchError> {
            self.batches.pop_front().ok_or(WatchError::Disconnected)
        }
    }

    fn ev(name: &str, kind: ChangeKind) -> FileChangeEvent {
        FileChangeEvent::new(name, "/data", kind)
    }

    #[test]
    fn run_preserves_reported_order_and_surfaces_errors() {
        let batches = VecDeque::from(vec![
            vec![ev("a", ChangeKind::Created), ev("a", ChangeKind::Modified)],
            vec![],
            vec![ev("b", ChangeKind::Deleted)],
        ]);
        let mut detector = ChangeDetector::with_watcher(Box::new(Scripted {
            root: PathBuf::from("/data"),
            batches,
        }));
        let queue = EventQueue::new(8);
        let stop = CancellationToken::new();

        let err = detector
            .run(&queue, &stop, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, WatchError::Disconnected));

        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue_timeout(Duration::ZERO)).collect();
        assert_eq!(
            drained,
            vec![
                ev("a", ChangeKind::Created),
                ev("a", ChangeKind::Modified),
                ev("b", ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn cancelled_detector_gives_up_on_full_queue() {
        let batches = VecDeque::from(vec![vec![ev("a", ChangeKind::Created), ev("b", ChangeKind::Created)]]);
        let mut detector = ChangeDetector::with_watcher(Box::new(Scripted {
            root: PathBuf::from("/data"),
            batches,
        }));
        let queue = EventQueue::new(1);
        let stop = CancellationToken::new();

        let canceller = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.cancel();
            })
        };
        detector
            .run(&queue, &stop, Duration::from_millis(10))
            .expect("clean stop");
        canceller.join().unwrap();
        assert_eq!(queue.len(), 1);
    }
}
