use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed frames. The stream can no longer be framed after one of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),

    #[error("filename length {0} is outside 1..=255 bytes")]
    NameLength(usize),

    #[error("filename is not valid UTF-8")]
    NameEncoding,

    #[error("unknown response status {0}")]
    UnknownStatus(u8),

    #[error("response message length {0} does not fit in a frame")]
    MessageLength(usize),

    #[error("response message is not valid UTF-8")]
    MessageEncoding,

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Failure of one transfer request, on either end of the connection.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A filesystem operation on the receiving side failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot connect to {peer}: {source}")]
    Connect {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket read or write failed mid-request.
    #[error("connection error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("short transfer: declared {expected} bytes, got {received}")]
    ShortTransfer { expected: u64, received: u64 },

    #[error("refusing unsafe filename '{0}'")]
    UnsafeName(String),

    #[error("remote refused '{name}': {message}")]
    Rejected { name: String, message: String },

    /// Turned away at the session limit. The server closes the connection
    /// right after this reply.
    #[error("remote is at its session limit")]
    Busy,

    #[error("no response within {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the connection is unusable after this error.
    ///
    /// Filesystem failures and per-request refusals leave the stream framed,
    /// so the session can carry on with the next request. [`Busy`] does not:
    /// the server hangs up after sending it.
    ///
    /// [`Busy`]: TransferError::Busy
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            TransferError::Io { .. } | TransferError::UnsafeName(_) | TransferError::Rejected { .. }
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.into(),
        source,
    }
}

/// Map a socket error, folding EOF into [`TransferError::ConnectionClosed`].
pub(crate) fn stream_err(source: std::io::Error) -> TransferError {
    if source.kind() == std::io::ErrorKind::UnexpectedEof {
        TransferError::ConnectionClosed
    } else {
        TransferError::Stream(source)
    }
}
