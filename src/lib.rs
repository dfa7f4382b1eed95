//! Taskpilot - drives an external CLI coding assistant through long-running,
//! multi-iteration development tasks with human-in-the-loop intervention.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{EngineError, EngineResult};
pub use infrastructure::{ConfigError, EngineConfig};
