//! Structured logging setup.
//!
//! Console output goes to stderr with ANSI colors, file output to a daily
//! rotated log under the runtime home. Filtering follows `DISKFORGE_LOG`,
//! falling back to `RUST_LOG`, then to `info`.

use crate::errors::DiskforgeResult;
use crate::runtime::layout::FilesystemLayout;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking writer alive for the process lifetime.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    std::env::var("DISKFORGE_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Initialize the global subscriber for a runtime home.
///
/// Safe to call more than once: later calls keep the first subscriber and
/// return Ok so multiple runtimes in one process do not fight over it.
pub(crate) fn init_logging_for(layout: &FilesystemLayout) -> DiskforgeResult<()> {
    let file_appender = tracing_appender::rolling::daily(layout.logs_dir(), "diskforge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer().with_writer(std::io::stderr);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    let init = tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if init.is_ok() {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
