use std::path::PathBuf;

use dirsync_core::CoreError;
use dirsync_detector::WatchError;
use dirsync_transfer::TransferError;
use thiserror::Error;

/// Error surface for the supervisor and its components.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A resource could not be acquired during startup. Everything acquired
    /// before `stage` has been released.
    #[error("startup failed at {stage}: {source}")]
    Init {
        stage: &'static str,
        #[source]
        source: Box<DaemonError>,
    },

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{task} task join failure: {message}")]
    Join { task: &'static str, message: String },
}

impl DaemonError {
    pub fn is_init(&self) -> bool {
        matches!(self, DaemonError::Init { .. })
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Wrap a startup failure with the stage it happened in.
pub(crate) fn init_err(stage: &'static str) -> impl FnOnce(DaemonError) -> DaemonError {
    move |source| DaemonError::Init {
        stage,
        source: Box::new(source),
    }
}
