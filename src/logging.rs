//! Logging bootstrap.
//!
//! Initialises the tracing subscriber with a rolling daily log file and
//! forwards all `log::` macro call sites into the tracing pipeline.
//! Verbosity is controlled by `RUST_LOG` (default `info`); log files
//! carry no colour escape codes.

use std::{path::PathBuf, sync::OnceLock};

// Keeps the non-blocking writer alive for the lifetime of the process.
static GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Initialise logging.  Safe to call more than once; later calls no-op.
pub fn init() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let log_dir = resolve_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "wardenclaw.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();

    tracing_log::LogTracer::init().ok();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wardenclaw starting");
}

fn resolve_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("wardenclaw"))
        .unwrap_or_else(std::env::temp_dir)
}
