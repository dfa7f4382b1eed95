//! Optional verification collaborator.
//!
//! When a gate is configured, a task whose completion criteria were met runs
//! through it before terminating: the task enters `Testing` and the verdict
//! maps to `Completed` or `Failed`. Without a gate the task finishes directly.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::models::Task;

#[derive(Debug, Clone)]
pub struct TestVerdict {
    pub passed: bool,
    pub output: String,
}

#[async_trait]
pub trait TestGate: Send + Sync {
    async fn verify(&self, task: &Task) -> EngineResult<TestVerdict>;
}
