//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set. Otherwise the controller crates log at the
//! requested level and everything else at `warn`. Every initialiser uses
//! `try_init`, so only the first call in a process installs a subscriber.

use tracing_subscriber::EnvFilter;

/// Output flavour of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines, no targets.
    Pretty,
    /// One JSON object per event.
    Json,
}

fn controller_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,mpb_core={level},mpb_transport={level}"))
    })
}

/// Install a subscriber with the given format and default level.
/// Returns false if one was already installed.
pub fn init_logging(format: LogFormat, level: &str) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(controller_filter(level))
        .with_thread_ids(true)
        .with_line_number(true);
    match format {
        LogFormat::Pretty => builder.with_target(false).try_init().is_ok(),
        LogFormat::Json => builder.with_target(true).json().try_init().is_ok(),
    }
}

/// Initialize logging for development (human-readable format)
pub fn init_dev_logging() {
    init_logging(LogFormat::Pretty, "debug");
}

/// Initialize logging for production (JSON format)
pub fn init_prod_logging() {
    init_logging(LogFormat::Json, "info");
}

/// Explicit filter directives, output captured by the test harness.
pub fn init_logging_with_filter(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}
