//! Infrastructure: configuration and logging bootstrap.

pub mod config;
pub mod logging;

pub use config::{ConfigError, EngineConfig};
pub use logging::init_logging;
