//! dirsync: mirror a directory to a remote peer as it changes.
//!
//! # Usage
//!
//! ```text
//! dirsync <DIRECTORY> [--config FILE] [--listen ADDR] [--port N] [--remote ADDR]
//!         [--serve-root DIR] [--max-sessions N] [--queue-capacity N]
//!         [--watch-mode event|poll] [--poll-interval-ms N] [--status-file FILE]
//!         [--verbose] [--log-json] [--print-config]
//! ```
//!
//! Without `--remote` the daemon sends to its own listener, mirroring
//! `DIRECTORY` into `--serve-root`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use dirsync_core::{SyncConfig, WatchMode};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "dirsync",
    version,
    about = "Watch a directory and stream every change to a remote peer",
    long_about = None,
)]
struct Cli {
    /// Directory to watch.
    directory: PathBuf,

    /// YAML file with defaults; flags given here override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address the transfer server binds to.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Port the transfer server binds to (keeps the listen IP).
    #[arg(long, value_name = "N")]
    port: Option<u16>,

    /// Peer to send changes to. Defaults to this daemon's own listener.
    #[arg(long, value_name = "ADDR")]
    remote: Option<SocketAddr>,

    /// Directory received changes are written under.
    #[arg(long, value_name = "DIR")]
    serve_root: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    max_sessions: Option<usize>,

    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// `event` for native notifications, `poll` for snapshot diffing.
    #[arg(long, value_name = "MODE")]
    watch_mode: Option<WatchMode>,

    #[arg(long, value_name = "N")]
    poll_interval_ms: Option<u64>,

    /// Mirror the status board into this JSON file.
    #[arg(long, value_name = "FILE")]
    status_file: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration as YAML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn into_config(self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };

        config.watch_root = self.directory;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.listen.set_port(port);
        }
        if let Some(remote) = self.remote {
            config.remote = Some(remote);
        }
        if let Some(serve_root) = self.serve_root {
            config.serve_root = serve_root;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(mode) = self.watch_mode {
            config.watch_mode = mode;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(status_file) = self.status_file {
            config.status_file = Some(status_file);
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (verbose, log_json, print_config) = (cli.verbose, cli.log_json, cli.print_config);
    let config = cli.into_config()?;

    if print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    ensure!(
        config.watch_root.is_dir(),
        "{} is not a directory",
        config.watch_root.display()
    );

    dirsync_daemon::init_tracing(verbose, log_json);
    tracing::debug!(?config, "effective configuration");
    dirsync_daemon::start_blocking(config).context("dirsync exited with error")?;
    Ok(())
}
