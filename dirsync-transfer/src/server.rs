//! Transfer server: accept loop, admission gate, and one task per session.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dirsync_core::{StatusBoard, SyncConfig};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::TransferError;
use crate::protocol::{Operation, Response, TransferRequest, BUSY_MESSAGE};
use crate::writer::ServeRoot;

/// How long a rejected connection is read from before it is closed.
const REJECT_DRAIN: Duration = Duration::from_secs(1);

/// A bound listener ready to serve sessions.
pub struct TransferServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    root: Arc<ServeRoot>,
    gate: Arc<Semaphore>,
    max_sessions: usize,
    board: StatusBoard,
}

impl TransferServer {
    /// Create the serve root and bind the listening socket.
    pub async fn bind(config: &SyncConfig, board: StatusBoard) -> Result<Self, TransferError> {
        let root = ServeRoot::open(&config.serve_root)?;
        let addr = config.listen;
        let bind_err = |source| TransferError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(config.backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(
            addr = %local_addr,
            root = %root.path().display(),
            max_sessions = config.max_sessions,
            "transfer server listening",
        );
        Ok(Self {
            listener,
            local_addr,
            root: Arc::new(root),
            gate: Arc::new(Semaphore::new(config.max_sessions)),
            max_sessions: config.max_sessions,
            board,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn serve_root(&self) -> &std::path::Path {
        self.root.path()
    }

    /// Accept connections until `stop` is cancelled or the listener fails.
    ///
    /// On return the listener is closed and every session task has ended.
    pub async fn run(self, stop: CancellationToken) -> Result<(), TransferError> {
        let TransferServer {
            listener,
            local_addr,
            root,
            gate,
            max_sessions,
            board,
        } = self;
        let sessions = TaskTracker::new();

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) if is_transient_accept_error(&err) => {
                            tracing::warn!(error = %err, "accept failed; continuing");
                            continue;
                        }
                        Err(err) => {
                            tracing::error!(addr = %local_addr, error = %err, "listener failed");
                            break Err(TransferError::Stream(err));
                        }
                    };

                    match gate.clone().try_acquire_owned() {
                        Ok(permit) => {
                            tracing::debug!(%peer, "session opened");
                            let session = Session {
                                peer,
                                root: root.clone(),
                                board: board.clone(),
                            };
                            let stop = stop.clone();
                            sessions.spawn(async move {
                                session.serve(stream, stop).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            tracing::warn!(%peer, max_sessions, "session limit reached; rejecting connection");
                            sessions.spawn(reject(stream, stop.clone()));
                        }
                    }
                }
            }
        };

        drop(listener);
        sessions.close();
        tracing::debug!(open = sessions.len(), "waiting for sessions to finish");
        sessions.wait().await;
        tracing::info!(addr = %local_addr, "transfer server stopped");
        result
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// Send the busy reply, then hang up.
///
/// Input the peer already sent is drained (up to [`REJECT_DRAIN`]) before the
/// socket closes; closing with unread data resets the connection and the
/// peer may lose the reply. A peer still streaming a large body after that
/// sees a reset instead of the reason.
async fn reject(mut stream: TcpStream, stop: CancellationToken) {
    let frame = Response::failure(BUSY_MESSAGE).encode();
    if let Err(err) = stream.write_all(&frame).await {
        tracing::debug!(error = %err, "could not send busy response");
        return;
    }
    let _ = stream.shutdown().await;

    let mut sink = tokio::io::sink();
    let drain = tokio::io::copy(&mut stream, &mut sink);
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::timeout(REJECT_DRAIN, drain) => {}
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    peer: SocketAddr,
    root: Arc<ServeRoot>,
    board: StatusBoard,
}

impl Session {
    async fn serve(self, stream: TcpStream, stop: CancellationToken) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = TransferRequest::read_async(&mut reader) => next,
            };
            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => {
                    tracing::debug!(peer = %self.peer, "peer closed session");
                    break;
                }
                Err(TransferError::Protocol(err)) => {
                    tracing::warn!(peer = %self.peer, error = %err, "malformed request; closing session");
                    self.board.record_failure(format!("{}: {err}", self.peer));
                    let _ = Response::failure(err.to_string()).write_async(&mut writer).await;
                    break;
                }
                Err(err) => {
                    tracing::warn!(peer = %self.peer, error = %err, "session read failed");
                    break;
                }
            };

            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                outcome = self.apply(&request, &mut reader) => outcome,
            };
            if !self.respond(&request, &outcome, &mut writer).await {
                break;
            }
            if matches!(&outcome, Err(err) if err.is_session_fatal()) {
                break;
            }
        }
        tracing::debug!(peer = %self.peer, "session closed");
    }

    async fn apply(
        &self,
        request: &TransferRequest,
        body: &mut BufReader<OwnedReadHalf>,
    ) -> Result<(), TransferError> {
        match request.operation {
            Operation::Create | Operation::Modify => {
                self.root
                    .receive(&request.filename, request.size, body)
                    .await?;
            }
            Operation::Delete => {
                self.root.remove(&request.filename).await?;
            }
        }
        Ok(())
    }

    /// Send the status frame. Returns `false` if the peer is gone.
    async fn respond(
        &self,
        request: &TransferRequest,
        outcome: &Result<(), TransferError>,
        writer: &mut OwnedWriteHalf,
    ) -> bool {
        let response = match outcome {
            Ok(()) => {
                tracing::info!(
                    peer = %self.peer,
                    name = %request.filename,
                    op = %request.operation,
                    bytes = request.body_len(),
                    "applied change",
                );
                Response::ok(format!("{} {}", request.operation, request.filename))
            }
            Err(err) => {
                tracing::warn!(
                    peer = %self.peer,
                    name = %request.filename,
                    op = %request.operation,
                    error = %err,
                    "request failed",
                );
                self.board
                    .record_failure(format!("{} {}: {err}", request.operation, request.filename));
                Response::failure(err.to_string())
            }
        };

        match response.write_async(writer).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(peer = %self.peer, error = %err, "could not send response");
                false
            }
        }
    }
}
