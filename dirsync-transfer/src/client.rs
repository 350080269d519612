//! Blocking transfer client.
//!
//! Every socket wait, read or write, is bounded by `tick` so the caller's
//! stop token is re-checked while a request is in flight; `io_timeout` caps
//! how long the peer may go without making progress.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{stream_err, TransferError};
use crate::protocol::{Response, TransferRequest, BUSY_MESSAGE, CHUNK_SIZE, RESPONSE_PREFIX_LEN};

pub struct TransferClient {
    stream: TcpStream,
    peer: SocketAddr,
    tick: Duration,
    io_timeout: Duration,
}

impl TransferClient {
    pub fn connect(peer: SocketAddr, tick: Duration, io_timeout: Duration) -> Result<Self, TransferError> {
        let connect_err = |source| TransferError::Connect { peer, source };
        let stream = TcpStream::connect_timeout(&peer, io_timeout).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream.set_read_timeout(Some(tick)).map_err(connect_err)?;
        stream.set_write_timeout(Some(tick)).map_err(connect_err)?;
        tracing::debug!(%peer, "connected to transfer server");
        Ok(Self {
            stream,
            peer,
            tick,
            io_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request and wait for its response.
    ///
    /// `body` must yield at least `request.body_len()` bytes; only that many
    /// are sent. If it runs dry first the connection is shut down (the server
    /// sees a short transfer) and [`TransferError::ShortTransfer`] is
    /// returned. A failure response becomes [`TransferError::Rejected`], or
    /// [`TransferError::Busy`] when the server turned the connection away.
    pub fn send<R: Read>(
        &mut self,
        request: &TransferRequest,
        mut body: R,
        stop: &CancellationToken,
    ) -> Result<Response, TransferError> {
        let header = request.encode_header()?;
        self.write_all_until(&header, stop)?;

        let expected = request.body_len();
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while sent < expected {
            if stop.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let want = (expected - sent).min(CHUNK_SIZE as u64) as usize;
            let n = match body.read(&mut buf[..want]) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = self.stream.shutdown(Shutdown::Both);
                    return Err(TransferError::Stream(err));
                }
            };
            if n == 0 {
                let _ = self.stream.shutdown(Shutdown::Both);
                return Err(TransferError::ShortTransfer {
                    expected,
                    received: sent,
                });
            }
            self.write_all_until(&buf[..n], stop)?;
            sent += n as u64;
        }
        self.stream.flush().map_err(stream_err)?;

        let response = self.read_response(stop)?;
        if response.ok {
            Ok(response)
        } else if response.message == BUSY_MESSAGE {
            Err(TransferError::Busy)
        } else {
            Err(TransferError::Rejected {
                name: request.filename.clone(),
                message: response.message,
            })
        }
    }

    fn read_response(&mut self, stop: &CancellationToken) -> Result<Response, TransferError> {
        let mut prefix = [0u8; RESPONSE_PREFIX_LEN];
        self.read_exact_until(&mut prefix, stop)?;
        let (ok, len) = Response::decode_prefix(prefix)?;
        let mut message = vec![0u8; len];
        self.read_exact_until(&mut message, stop)?;
        Ok(Response::from_parts(ok, message)?)
    }

    /// `read_exact` that wakes every tick to check `stop` and the stall
    /// deadline.
    fn read_exact_until(&mut self, mut buf: &mut [u8], stop: &CancellationToken) -> Result<(), TransferError> {
        let mut deadline = Instant::now() + self.io_timeout;
        while !buf.is_empty() {
            match self.stream.read(buf) {
                Ok(0) => return Err(TransferError::ConnectionClosed),
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    deadline = Instant::now() + self.io_timeout;
                }
                Err(err) if is_tick_expiry(&err) => {
                    self.check_wait(stop, deadline)?;
                    tracing::trace!(peer = %self.peer, tick_ms = self.tick.as_millis() as u64, "waiting for response");
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(stream_err(err)),
            }
        }
        Ok(())
    }

    /// `write_all` with the same wake-up discipline as [`Self::read_exact_until`].
    fn write_all_until(&mut self, mut buf: &[u8], stop: &CancellationToken) -> Result<(), TransferError> {
        let mut deadline = Instant::now() + self.io_timeout;
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(TransferError::ConnectionClosed),
                Ok(n) => {
                    buf = &buf[n..];
                    deadline = Instant::now() + self.io_timeout;
                }
                Err(err) if is_tick_expiry(&err) => {
                    self.check_wait(stop, deadline)?;
                    tracing::trace!(peer = %self.peer, remaining = buf.len(), "peer not reading");
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(stream_err(err)),
            }
        }
        Ok(())
    }

    fn check_wait(&self, stop: &CancellationToken, deadline: Instant) -> Result<(), TransferError> {
        if stop.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(TransferError::TimedOut(self.io_timeout));
        }
        Ok(())
    }
}

fn is_tick_expiry(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
