//! Coauthor Daemon - Co-Authoring Agent Server
//!
//! Entry point for the coauthor daemon. Editor plugins and other clients
//! connect over a Unix socket, name a session in their handshake, and chat
//! with an agent that edits the session's shared document.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! coauthor-daemon
//!
//! # Custom socket path
//! coauthor-daemon --socket-path /tmp/coauthor.sock
//!
//! # With config file and a different model
//! coauthor-daemon --config ~/.config/coauthor/coauthor.toml --model mistral
//!
//! # Verbose logging
//! RUST_LOG=debug coauthor-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Log connection and session statistics

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use coauthor_core::{
    config::{load_config_from_path, ConfigOverrides},
    default_config_path, transport::default_socket_path, Conductor, LlmBackend, MemoryDocuments,
    OllamaBackend,
};
use server::DaemonServer;

/// Coauthor Daemon - streaming co-authoring agent server
#[derive(Parser, Debug)]
#[command(name = "coauthor-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "COAUTHOR_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "COAUTHOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model to use (overrides config and environment)
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// Maximum model passes per user message
    #[arg(long, value_name = "N")]
    max_iterations: Option<u32>,

    /// Apply document edits without the typing animation
    #[arg(long)]
    instant_typing: bool,

    /// PID file path
    #[arg(long, env = "COAUTHOR_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "COAUTHOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another daemon is running by checking PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks that the process exists
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another coauthor-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "coauthor_daemon={level},coauthor_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Forward SIGTERM/SIGINT to `shutdown` and SIGHUP to `dump_status`
fn spawn_signal_handler(shutdown: Arc<AtomicBool>, dump_status: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, logging status");
                    dump_status.store(true, Ordering::SeqCst);
                }
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Coauthor daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    // Configuration: CLI > env > file > defaults
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    let mut overrides = ConfigOverrides::new().with_instant_typing(args.instant_typing);
    if let Some(model) = args.model {
        overrides = overrides.with_model(model);
    }
    if let Some(n) = args.max_iterations {
        overrides = overrides.with_max_iterations(n);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = ?config.source(),
        file = ?config.config_file_path,
        model = %config.agent.model,
        "Configuration loaded"
    );

    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);
    let pid_path = args
        .pid_file
        .unwrap_or_else(|| socket_path.with_file_name("coauthor.pid"));

    info!(socket_path = ?socket_path, "Socket path");
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let dump_status = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown), Arc::clone(&dump_status))?;

    let backend = OllamaBackend::from_env();
    if !backend.health_check().await {
        warn!(backend = backend.name(), "Model backend is not reachable yet; requests will fail until it is");
    }

    let conductor = Arc::new(Conductor::new(
        backend,
        Arc::new(MemoryDocuments::new()),
        config,
    ));
    let mut server = DaemonServer::new(socket_path.clone(), conductor);

    let result = server.run(shutdown, dump_status).await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    match result {
        Ok(()) => {
            info!("Coauthor daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
