use std::path::PathBuf;

use thiserror::Error;

/// Failures of the notification subsystem. Fatal to the detector only.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch root does not exist: {path}")]
    RootMissing { path: PathBuf },

    #[error("watch root is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("notification channel closed")]
    Disconnected,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WatchError {
    WatchError::Io {
        path: path.into(),
        source,
    }
}
