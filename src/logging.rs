//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! `start` gets a daily-rotated JSON file plus a console layer
//! ([`init_production`]); `check` logs to the console only ([`init_cli`]).
//!
//! Audit records emitted by [`crate::audit::TracingAuditSink`] use the
//! [`AUDIT_TARGET`] target. They always reach the JSON file, whatever the
//! configured level, and are kept off the console.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Target used for audit records.
pub const AUDIT_TARGET: &str = "audit";

/// Base name of the rolling log file.
const LOG_FILE_PREFIX: &str = "tblwatch.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping it flushes pending entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Filter directives: `RUST_LOG` wins, otherwise `level` with audit records
/// always enabled.
pub fn filter_directives(level: &str, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => directives.to_owned(),
        None => format!("{level},{AUDIT_TARGET}=info"),
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directives = filter_directives(level, rust_log.as_deref());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the production subscriber.
///
/// Writes JSON to `{dir}/tblwatch.log.YYYY-MM-DD` and human-readable lines to
/// stderr.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let dir = &config.dir;
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("failed to create log directory {}: {e}", dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(|meta| meta.target() != AUDIT_TARGET));

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Console-only logging for one-shot subcommands. `RUST_LOG` applies.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .try_init();
}
