//! dirsync core library: shared domain types, the bounded event queue,
//! the status board, and configuration.
//!
//! - [`types`]: [`FileChangeEvent`] and [`ChangeKind`]
//! - [`queue`]: [`EventQueue`], the blocking FIFO between detector and dispatcher
//! - [`status`]: [`StatusBoard`], the externally readable sync status
//! - [`config`]: [`SyncConfig`] and its YAML loader
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod queue;
pub mod status;
pub mod types;

pub use config::{SyncConfig, WatchMode};
pub use error::CoreError;
pub use queue::{EventQueue, DEFAULT_QUEUE_CAPACITY};
pub use status::{StatusBoard, StatusCode, SyncStatus};
pub use types::{ChangeKind, FileChangeEvent, MAX_NAME_LEN};
