// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Moor coordinator daemon (moord)
//!
//! Hosts one lock engine per project so that test processes running in
//! parallel agree on who holds the namespace, builds, and containers.

use std::path::PathBuf;

use clap::Parser;
use moor_daemon::lifecycle::{self, Config, LifecycleError};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "moord", version, about = "Moor lock coordinator")]
struct Args {
    /// Project root the coordinator serves (defaults to the current directory)
    project_root: Option<PathBuf>,

    /// Listen on this socket instead of the per-project default
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log to stderr instead of the project log file
    #[arg(long)]
    foreground_log: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let project_root = match args.project_root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    let mut config = Config::for_project(&project_root)?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    // Before tracing setup, so the launcher can find where this attempt begins
    write_startup_marker(&config)?;

    let log_guard = setup_logging(&config, args.foreground_log)?;

    info!("Starting moord for project: {}", config.project_root.display());

    let mut daemon = match lifecycle::startup(&config).await {
        Ok(d) => d,
        Err(e) => {
            // Tracing is non-blocking and may not flush before exit
            write_startup_error(&config, &e);
            error!("Failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    let Some(listener) = daemon.take_listener() else {
        return Err("listener already taken".into());
    };
    let shutdown = daemon.server.shutdown_token();
    let run = tokio::spawn(std::sync::Arc::clone(&daemon.server).run(listener));
    tokio::pin!(run);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(
        "Daemon ready, listening on {}",
        config.socket_path.display()
    );

    // Signal ready for the parent process
    println!("READY");

    let finished = tokio::select! {
        result = &mut run => {
            info!("Shutdown requested via IPC");
            Some(result)
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            shutdown.cancel();
            run.await
        }
    };
    if let Err(e) = result {
        error!("Accept loop panicked: {}", e);
    }

    daemon.shutdown()?;
    info!("Daemon stopped");
    Ok(())
}

/// Startup marker prefix written to log before anything else.
/// Full format: "--- moord: starting (pid: 12345) ---"
const STARTUP_MARKER_PREFIX: &str = "--- moord: starting (pid: ";

fn write_startup_marker(config: &Config) -> Result<(), LifecycleError> {
    use std::io::Write;

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)?;
    writeln!(file, "{}{}) ---", STARTUP_MARKER_PREFIX, std::process::id())?;

    Ok(())
}

/// Write startup error synchronously to the log file
fn write_startup_error(config: &Config, error: &LifecycleError) {
    use std::io::Write;

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    else {
        return;
    };
    let _ = writeln!(file, "ERROR Failed to start daemon: {}", error);
}

fn setup_logging(
    config: &Config,
    foreground: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let (non_blocking, guard) = if foreground {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        let dir = config.log_path.parent().ok_or(LifecycleError::NoStateDir)?;
        std::fs::create_dir_all(dir)?;
        let file_name = config
            .log_path
            .file_name()
            .ok_or(LifecycleError::NoStateDir)?;
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
