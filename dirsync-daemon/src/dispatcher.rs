//! Dispatcher: drains the event queue and sends each change to the remote.
//!
//! Delivery is at-most-once. A failed event is logged, recorded on the
//! status board, and dropped; the next event is tried on a fresh connection
//! if the failure left the old one unusable.

use std::fs::File;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dirsync_core::{EventQueue, FileChangeEvent, StatusBoard};
use dirsync_transfer::{Operation, TransferClient, TransferError, TransferRequest};
use tokio_util::sync::CancellationToken;

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The file vanished before it could be read; a Deleted event follows.
    Skipped,
}

/// Counters returned when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    queue: Arc<EventQueue<FileChangeEvent>>,
    remote: SocketAddr,
    board: StatusBoard,
    tick: Duration,
    io_timeout: Duration,
    client: Option<TransferClient>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<EventQueue<FileChangeEvent>>,
        remote: SocketAddr,
        board: StatusBoard,
        tick: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            remote,
            board,
            tick,
            io_timeout,
            client: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Dequeue and send until `stop` is cancelled. Blocks the calling thread.
    pub fn run(&mut self, stop: &CancellationToken) -> DispatchStats {
        tracing::info!(remote = %self.remote, "dispatcher running");
        let mut stats = DispatchStats::default();

        while !stop.is_cancelled() {
            let Some(event) = self.queue.dequeue_timeout(self.tick) else {
                continue;
            };
            match self.dispatch(&event, stop) {
                Ok(Delivery::Sent) => {
                    tracing::info!(name = %event.name, kind = %event.kind, "synced");
                    self.board.record_synced(&event.name);
                    stats.sent += 1;
                }
                Ok(Delivery::Skipped) => stats.skipped += 1,
                Err(TransferError::Cancelled) => {
                    tracing::debug!(name = %event.name, "transfer abandoned on shutdown");
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        name = %event.name,
                        kind = %event.kind,
                        remote = %self.remote,
                        error = %err,
                        "transfer failed; event dropped",
                    );
                    self.board
                        .record_failure(format!("{} {}: {err}", event.kind, event.name));
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            sent = stats.sent,
            skipped = stats.skipped,
            failed = stats.failed,
            "dispatcher stopped"
        );
        stats
    }

    /// Send one event. Drops the connection if the failure left it unusable.
    pub fn dispatch(
        &mut self,
        event: &FileChangeEvent,
        stop: &CancellationToken,
    ) -> Result<Delivery, TransferError> {
        let result = self.send_event(event, stop);
        if matches!(&result, Err(err) if err.is_session_fatal()) {
            self.client = None;
        }
        result
    }

    fn send_event(
        &mut self,
        event: &FileChangeEvent,
        stop: &CancellationToken,
    ) -> Result<Delivery, TransferError> {
        let operation = Operation::from(event.kind);
        if !operation.has_body() {
            let request = TransferRequest::delete(event.name.as_str());
            self.connection()?.send(&request, std::io::empty(), stop)?;
            return Ok(Delivery::Sent);
        }

        // Open before connecting so a vanished file costs no round trip.
        let path = event.path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "file vanished before sending; skipped");
                return Ok(Delivery::Skipped);
            }
            Err(source) => return Err(TransferError::Io { path, source }),
        };
        let meta = file.metadata().map_err(|source| TransferError::Io {
            path: path.clone(),
            source,
        })?;
        if !meta.is_file() {
            tracing::debug!(path = %path.display(), "not a regular file; skipped");
            return Ok(Delivery::Skipped);
        }

        let request = TransferRequest::new(event.name.as_str(), operation, meta.len());
        self.connection()?.send(&request, file, stop)?;
        Ok(Delivery::Sent)
    }

    fn connection(&mut self) -> Result<&mut TransferClient, TransferError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => TransferClient::connect(self.remote, self.tick, self.io_timeout)?,
        };
        Ok(self.client.insert(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::ChangeKind;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn unused_addr() -> SocketAddr {
        // Bind then drop so nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn vanished_file_is_skipped_without_connecting() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(EventQueue::new(4));
        let mut dispatcher = Dispatcher::new(
            queue,
            unused_addr(),
            StatusBoard::new(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let event = FileChangeEvent::new("gone.txt", dir.path(), ChangeKind::Created);
        let delivery = dispatcher
            .dispatch(&event, &CancellationToken::new())
            .unwrap();
        assert_eq!(delivery, Delivery::Skipped);
        assert!(dispatcher.client.is_none());
    }

    #[test]
    fn unreachable_remote_is_recorded_and_run_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let queue = Arc::new(EventQueue::new(4));
        let board = StatusBoard::new();
        let mut dispatcher = Dispatcher::new(
            queue.clone(),
            unused_addr(),
            board.clone(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        queue.enqueue(FileChangeEvent::new("a.txt", dir.path(), ChangeKind::Created));
        queue.enqueue(FileChangeEvent::new("b.txt", dir.path(), ChangeKind::Deleted));

        let stop = CancellationToken::new();
        let canceller = {
            let stop = stop.clone();
            let queue = queue.clone();
            std::thread::spawn(move || {
                while !queue.is_empty() {
                    std::thread::sleep(Duration::from_millis(10));
                }
                std::thread::sleep(Duration::from_millis(100));
                stop.cancel();
            })
        };
        let stats = dispatcher.run(&stop);
        canceller.join().unwrap();

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.sent, 0);
        let status = board.snapshot();
        assert_eq!(status.synced_files, 0);
        assert!(status.last_error.unwrap().starts_with("deleted b.txt"));
    }

    fn dispatch_blocking(
        mut dispatcher: Dispatcher,
        event: FileChangeEvent,
    ) -> tokio::task::JoinHandle<(Dispatcher, Result<Delivery, TransferError>)> {
        tokio::task::spawn_blocking(move || {
            let result = dispatcher.dispatch(&event, &CancellationToken::new());
            (dispatcher, result)
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_server_costs_only_the_rejected_event() {
        use dirsync_core::SyncConfig;
        use dirsync_transfer::{Response, TransferServer};
        use tokio::io::AsyncWriteExt;

        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("watched");
        std::fs::create_dir(&watched).unwrap();
        std::fs::write(watched.join("b.txt"), "bee").unwrap();

        let mut config = SyncConfig::new(&watched);
        config.serve_root = dir.path().join("mirror");
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.max_sessions = 1;
        let server = TransferServer::bind(&config, StatusBoard::new()).await.unwrap();
        let addr = server.local_addr();
        let mirror = server.serve_root().to_path_buf();
        let stop_server = CancellationToken::new();
        let server = tokio::spawn(server.run(stop_server.clone()));

        // Take the only session slot.
        let mut holder = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = TransferRequest::new("held", Operation::Create, 1);
        holder.write_all(&request.encode_header().unwrap()).await.unwrap();
        holder.write_all(b"1").await.unwrap();
        assert!(Response::read_async(&mut holder).await.unwrap().ok);

        let dispatcher = Dispatcher::new(
            Arc::new(EventQueue::new(4)),
            addr,
            StatusBoard::new(),
            Duration::from_millis(20),
            Duration::from_secs(5),
        );
        let deleted = FileChangeEvent::new("a.txt", &watched, ChangeKind::Deleted);
        let (dispatcher, first) = dispatch_blocking(dispatcher, deleted).await.unwrap();
        assert!(matches!(first, Err(TransferError::Busy)), "{first:?}");
        assert!(dispatcher.client.is_none());

        // Free the slot and give the server a moment to release it.
        drop(holder);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let created = FileChangeEvent::new("b.txt", &watched, ChangeKind::Created);
        let (_, second) = dispatch_blocking(dispatcher, created).await.unwrap();
        assert_eq!(second.unwrap(), Delivery::Sent);
        assert_eq!(std::fs::read(mirror.join("b.txt")).unwrap(), b"bee");

        stop_server.cancel();
        server.await.unwrap().unwrap();
    }
}
