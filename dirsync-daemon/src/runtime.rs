use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use dirsync_core::{EventQueue, FileChangeEvent, StatusBoard, StatusCode, SyncConfig};
use dirsync_detector::{ChangeDetector, WatchError};
use dirsync_transfer::{TransferError, TransferServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{init_err, io_err, DaemonError};

/// Lifecycle of one [`Supervisor::run`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Init => write!(f, "init"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::ShuttingDown => write!(f, "shutting_down"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Start the daemon and block the current thread until it exits.
///
/// Ctrl-C (and SIGTERM on Unix) trigger an orderly shutdown.
pub fn start_blocking(config: SyncConfig) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let signals = tokio::spawn(wait_for_signal(shutdown.clone()));
        let result = run(config, shutdown).await;
        signals.abort();
        result
    })
}

/// Run the pipeline until `shutdown` is cancelled.
pub async fn run(config: SyncConfig, shutdown: CancellationToken) -> Result<(), DaemonError> {
    Supervisor::new(config).run(shutdown).await
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    config: SyncConfig,
    state: SupervisorState,
    board: StatusBoard,
}

/// Handles to the running components, in startup order.
struct Pipeline {
    queue: Arc<EventQueue<FileChangeEvent>>,
    server_stop: CancellationToken,
    server: JoinHandle<Result<(), TransferError>>,
    detector_stop: CancellationToken,
    detector: JoinHandle<Result<(), WatchError>>,
    dispatcher_stop: CancellationToken,
    dispatcher: JoinHandle<DispatchStats>,
}

impl Supervisor {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Init,
            board: StatusBoard::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::info!(from = %self.state, to = %next, "supervisor state change");
        self.state = next;
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let pipeline = match self.start(&shutdown).await {
            Ok(pipeline) => pipeline,
            Err(err) => {
                tracing::error!(error = %err, "startup failed; rolled back");
                self.release_status();
                self.transition(SupervisorState::Stopped);
                return Err(err);
            }
        };

        self.board.set_code(StatusCode::Running);
        self.transition(SupervisorState::Running);
        self.wait_for_shutdown(&shutdown).await;

        self.transition(SupervisorState::ShuttingDown);
        self.board.set_code(StatusCode::ShuttingDown);
        let result = self.teardown(pipeline).await;
        self.release_status();
        self.transition(SupervisorState::Stopped);
        result
    }

    /// Acquire resources in order: status, queue, listener, detector,
    /// dispatcher. On failure everything already acquired is released in
    /// reverse order before returning.
    async fn start(&mut self, shutdown: &CancellationToken) -> Result<Pipeline, DaemonError> {
        let config = self.config.clone();
        config
            .validate()
            .map_err(|e| init_err("config")(e.into()))?;

        // Status channel.
        self.board.set_code(StatusCode::Starting);
        if let Some(path) = &config.status_file {
            self.board
                .persist(path)
                .map_err(|e| init_err("status")(e.into()))?;
        }

        // Event queue.
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        tracing::debug!(capacity = queue.capacity(), "event queue ready");

        // Listening socket. Sessions are served from here on.
        let server = TransferServer::bind(&config, self.board.clone())
            .await
            .map_err(|e| init_err("listener")(e.into()))?;
        let remote = config
            .remote
            .unwrap_or_else(|| loopback_target(server.local_addr()));
        let server_stop = CancellationToken::new();
        let server_handle = {
            let stop = server_stop.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = server.run(stop).await;
                shutdown.cancel();
                result
            })
        };

        // Change detector.
        let watch_root = config.watch_root.clone();
        let (mode, interval) = (config.watch_mode, config.poll_interval());
        let detector = match tokio::task::spawn_blocking(move || {
            ChangeDetector::watch(&watch_root, mode, interval)
        })
        .await
        {
            Ok(Ok(detector)) => detector,
            Ok(Err(err)) => {
                stop_server(server_stop, server_handle).await;
                return Err(init_err("detector")(err.into()));
            }
            Err(err) => {
                stop_server(server_stop, server_handle).await;
                return Err(init_err("detector")(join_err("detector", err)));
            }
        };
        let detector_stop = CancellationToken::new();
        let detector_handle = {
            let mut detector = detector;
            let queue = queue.clone();
            let stop = detector_stop.clone();
            let shutdown = shutdown.clone();
            let tick = config.tick();
            tokio::task::spawn_blocking(move || {
                let result = detector.run(&queue, &stop, tick);
                if let Err(err) = &result {
                    tracing::error!(error = %err, "change detector failed");
                }
                shutdown.cancel();
                result
            })
        };

        // Dispatcher.
        let dispatcher_stop = CancellationToken::new();
        let dispatcher_handle = {
            let mut dispatcher = Dispatcher::new(
                queue.clone(),
                remote,
                self.board.clone(),
                config.tick(),
                config.io_timeout(),
            );
            let stop = dispatcher_stop.clone();
            tokio::task::spawn_blocking(move || dispatcher.run(&stop))
        };

        tracing::info!(
            watch_root = %config.watch_root.display(),
            remote = %remote,
            mode = %config.watch_mode,
            "dirsync running",
        );
        Ok(Pipeline {
            queue,
            server_stop,
            server: server_handle,
            detector_stop,
            detector: detector_handle,
            dispatcher_stop,
            dispatcher: dispatcher_handle,
        })
    }

    /// Wait for `shutdown`, persisting the status file whenever it changed.
    async fn wait_for_shutdown(&self, shutdown: &CancellationToken) {
        let mut persisted = self.persist_status(None);
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => persisted = self.persist_status(persisted),
            }
        }
    }

    /// Stop components in order: detector, dispatcher, listener and
    /// sessions, then the queue.
    async fn teardown(&self, pipeline: Pipeline) -> Result<(), DaemonError> {
        let Pipeline {
            queue,
            server_stop,
            server,
            detector_stop,
            detector,
            dispatcher_stop,
            dispatcher,
        } = pipeline;

        detector_stop.cancel();
        let detector_result = handle_join("detector", detector.await);
        tracing::debug!("change detector joined");

        dispatcher_stop.cancel();
        let dispatcher_result = handle_join("dispatcher", dispatcher.await);
        if let Ok(stats) = &dispatcher_result {
            tracing::debug!(sent = stats.sent, failed = stats.failed, "dispatcher joined");
        }

        server_stop.cancel();
        let server_result = handle_join("server", server.await);
        tracing::debug!("transfer server joined");

        let dropped = queue.len();
        if dropped > 0 {
            tracing::warn!(dropped, "discarding undelivered events");
        }
        drop(queue);

        detector_result?.map_err(DaemonError::from)?;
        dispatcher_result?;
        server_result?.map_err(DaemonError::from)?;
        Ok(())
    }

    /// Persist if the board changed since `last`. Returns the revision on disk.
    fn persist_status(&self, last: Option<u64>) -> Option<u64> {
        let path = self.config.status_file.as_ref()?;
        let revision = self.board.revision();
        if last == Some(revision) {
            return last;
        }
        match self.board.persist(path) {
            Ok(()) => Some(revision),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not persist status");
                last
            }
        }
    }

    /// Final status write; the board reads `stopped` from here on.
    fn release_status(&self) {
        self.board.set_code(StatusCode::Stopped);
        if let Some(path) = &self.config.status_file {
            if let Err(err) = self.board.persist(path) {
                tracing::warn!(path = %path.display(), error = %err, "could not persist final status");
            }
        }
    }
}

async fn stop_server(stop: CancellationToken, handle: JoinHandle<Result<(), TransferError>>) {
    stop.cancel();
    if let Err(err) = handle_join("server", handle.await) {
        tracing::warn!(error = %err, "transfer server did not stop cleanly");
    }
}

/// Where the dispatcher sends when no remote is configured.
fn loopback_target(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down");
                shutdown.cancel();
            }
            Err(err) => {
                tracing::warn!(error = %err, "ctrl-c handler failed");
                shutdown.cancelled().await;
            }
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
            shutdown.cancel();
        }
    }
}

fn handle_join<T>(task: &'static str, result: Result<T, tokio::task::JoinError>) -> Result<T, DaemonError> {
    result.map_err(|err| join_err(task, err))
}

fn join_err(task: &'static str, err: tokio::task::JoinError) -> DaemonError {
    DaemonError::Join {
        task,
        message: err.to_string(),
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_replaces_wildcard_addresses() {
        assert_eq!(
            loopback_target("0.0.0.0:8080".parse().unwrap()),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            loopback_target("[::]:9000".parse().unwrap()),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            loopback_target("10.0.0.5:7000".parse().unwrap()),
            "10.0.0.5:7000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn state_display_is_snake_case() {
        assert_eq!(SupervisorState::ShuttingDown.to_string(), "shutting_down");
    }

    #[tokio::test]
    async fn invalid_config_fails_before_anything_starts() {
        let mut supervisor = Supervisor::new(SyncConfig::default());
        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Init { stage: "config", .. }));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.board().snapshot().code, StatusCode::Stopped);
    }
}
