//! Change detection for dirsync.
//!
//! A [`ChangeDetector`] drives one [`DirectoryWatcher`] and pushes every
//! [`FileChangeEvent`](dirsync_core::FileChangeEvent) it reports into the
//! shared event queue, in the order the watcher reported them.
//!
//! Two watcher variants emit the same event stream:
//! - [`NotifyWatcher`]: native notifications with per-file detail.
//! - [`SnapshotWatcher`]: periodic directory listings diffed against the
//!   previous listing, for platforms that only signal "something changed".

mod detector;
mod error;
pub mod normalize;
pub mod notify_watcher;
pub mod snapshot;

pub use detector::{ChangeDetector, DirectoryWatcher};
pub use error::WatchError;
pub use notify_watcher::NotifyWatcher;
pub use snapshot::{FileStamp, Snapshot, SnapshotWatcher};
