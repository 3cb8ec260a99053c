//! Logging setup for the daemon.
//!
//! Linux gets journald so `journalctl -u curata` shows the reconciler's
//! decisions; elsewhere (or when journald is unreachable) logs roll daily
//! into a file. Verbosity comes from the `CURATA_LOG` environment variable
//! using the usual `EnvFilter` syntax, defaulting to `info`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Keeps the non-blocking writer alive for the process lifetime; init runs
// once at startup.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_env("CURATA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    if let Ok(journald) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter)
            .with(journald)
            .init();
        tracing::info!("Logging to journald");
        return Ok(());
    }

    init_file_backend(filter, log_dir)
}

fn init_file_backend(filter: EnvFilter, log_dir: Option<PathBuf>) -> Result<()> {
    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, "curata.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    tracing::info!(dir = %log_dir.display(), "Logging to rolling file");
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("curata")
        .join("logs")
}
