//! Verification gate implementations.

pub mod command;

pub use command::CommandTestGate;
