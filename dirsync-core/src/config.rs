//! Runtime configuration shared by every component.
//!
//! All fields have defaults; a YAML file may override any subset of them and
//! the CLI overrides the file. Durations are stored as milliseconds so the
//! YAML stays flat.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKLOG: u32 = 10;
pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SERVE_ROOT: &str = "dirsync-received";

/// How the change detector learns about mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications carrying a filename and operation.
    #[default]
    Event,
    /// Periodic directory snapshots diffed against the previous one.
    Poll,
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMode::Event => write!(f, "event"),
            WatchMode::Poll => write!(f, "poll"),
        }
    }
}

impl FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "event" => Ok(WatchMode::Event),
            "poll" => Ok(WatchMode::Poll),
            other => Err(format!(
                "unknown watch mode '{other}'; expected: event, poll"
            )),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Directory whose changes are propagated.
    pub watch_root: PathBuf,
    /// Directory the transfer server applies received changes under.
    pub serve_root: PathBuf,
    /// Address the transfer server listens on.
    pub listen: SocketAddr,
    /// Peer the dispatcher sends to; `None` targets this daemon's own listener.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<SocketAddr>,
    pub backlog: u32,
    pub max_sessions: usize,
    pub queue_capacity: usize,
    pub watch_mode: WatchMode,
    pub poll_interval_ms: u64,
    /// Upper bound on every blocking wait before the stop flag is re-checked.
    pub tick_ms: u64,
    pub io_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch_root: PathBuf::new(),
            serve_root: PathBuf::from(DEFAULT_SERVE_ROOT),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            remote: None,
            backlog: DEFAULT_BACKLOG,
            max_sessions: DEFAULT_MAX_SESSIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            watch_mode: WatchMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            tick_ms: DEFAULT_TICK_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            status_file: None,
        }
    }
}

impl SyncConfig {
    /// Defaults with the given watch root.
    pub fn new(watch_root: impl Into<PathBuf>) -> Self {
        Self {
            watch_root: watch_root.into(),
            ..Self::default()
        }
    }

    /// Load a YAML config file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let config = serde_yaml::from_str(&contents).map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, CoreError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.watch_root.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig("watch_root is not set".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(CoreError::InvalidConfig(
                "max_sessions must be at least 1".into(),
            ));
        }
        if self.backlog == 0 {
            return Err(CoreError::InvalidConfig("backlog must be at least 1".into()));
        }
        if self.tick_ms == 0 || self.poll_interval_ms == 0 || self.io_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "tick_ms, poll_interval_ms and io_timeout_ms must be non-zero".into(),
            ));
        }
        if same_dir(&self.watch_root, &self.serve_root) {
            return Err(CoreError::InvalidConfig(format!(
                "serve_root must differ from watch_root ({})",
                self.watch_root.display()
            )));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
