//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Production** ([`init_production`]): JSON file layers (daily rotation) + console layer
//! - **CLI** ([`init_cli`]): console-only for one-shot subcommands
//!
//! Security events (cross-tenant references and findings, tenant mismatches,
//! operator tenant assumption) carry a `security_event` field. In production
//! they are also written to their own rotated JSON file.

use std::path::Path;

use tracing::Metadata;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// File name prefix of the rotated JSON log.
pub const LOG_FILE_NAME: &str = "clinic-kernel.log";

/// File name prefix of the rotated security event log.
pub const SECURITY_LOG_FILE_NAME: &str = "clinic-kernel-security.log";

/// Field that marks an event as a tenant-boundary security event.
pub const SECURITY_EVENT_FIELD: &str = "security_event";

/// Filter used when `RUST_LOG` is unset. sqlx logs every statement at info.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

/// Holds the non-blocking writer guards for file logging.
///
/// The guards must be kept alive for the duration of the process.
/// Dropping them flushes pending log entries and closes the files.
pub struct LoggingGuard {
    _main: WorkerGuard,
    _security: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Whether a callsite declares the security event marker field.
pub fn is_security_event(metadata: &Metadata<'_>) -> bool {
    metadata.is_event() && metadata.fields().field(SECURITY_EVENT_FIELD).is_some()
}

/// Initialise logging for long-running subcommands (`watch`).
///
/// Writes JSON logs to `{logs_dir}/clinic-kernel.log.YYYY-MM-DD` and security
/// events additionally to `{logs_dir}/clinic-kernel-security.log.YYYY-MM-DD`,
/// both with daily rotation. Human-readable output goes to stderr, controlled
/// by `RUST_LOG` (default: `info`, sqlx at `warn`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed. The directory and files are created first
/// either way.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let (main_writer, main_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_NAME));
    let (security_writer, security_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, SECURITY_LOG_FILE_NAME),
    );

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(main_writer);

    let security_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(security_writer)
        .with_filter(filter_fn(is_security_event));

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(security_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard {
        _main: main_guard,
        _security: security_guard,
    })
}

/// Initialise minimal logging for one-shot subcommands.
///
/// Emits human-readable output to stderr only. A second call is a no-op.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}
