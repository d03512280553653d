//! File logging for the agent. Console output stays reserved for the
//! session driver itself.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init(data_dir: &Path) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "rondo-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    guard
}
