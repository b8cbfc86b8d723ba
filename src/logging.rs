//! File-based logging for spotils
//!
//! Everything goes to a daily rolling file; warnings and errors are also
//! printed to stderr so a long-running `spotils run` shows problems without
//! drowning the cycle summaries on stdout.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::APP_NAME;

/// Initialize the logging system.
///
/// Logs are written to `<log_dir>/spotils.YYYY-MM-DD`. `RUST_LOG` overrides
/// the configured `level`, which otherwise applies to this crate only:
/// - `spotils`: `level`
/// - `librespot_oauth`: INFO
/// - Other crates: WARN
///
/// The returned guard flushes the file writer when dropped.
pub fn init_logging(log_dir: &Path, level: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, APP_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{APP_NAME}={level},librespot_oauth=info,warn")))?;

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    tracing::info!(dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}
