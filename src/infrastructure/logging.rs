//! Tracing bootstrap for the binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use super::config::EngineConfig;

/// Initialize the global subscriber from the engine configuration.
///
/// `RUST_LOG` wins over the configured level. When `log_dir` is given, output
/// additionally goes to a daily-rotated file; the returned guard must be held
/// for the life of the process so buffered lines are flushed.
pub fn init_logging(config: &EngineConfig, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskpilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.log_format == "json" {
                fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.log_format == "json" {
                fmt().json().with_env_filter(filter).init();
            } else {
                fmt().with_env_filter(filter).init();
            }
            None
        }
    }
}
