//! Error taxonomy for the task-automation engine.

use thiserror::Error;
use uuid::Uuid;

/// Engine-level errors surfaced by the core components.
///
/// Unknown task names and bad state transitions are both `Validation`: the
/// control surface rejects them without touching task state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("write conflict on task {0}")]
    Conflict(Uuid),

    #[error("branch '{branch}' is already in use by another active task under {root}")]
    BranchInUse { root: String, branch: String },

    #[error("workspace reclaim blocked: {0}")]
    ReclaimBlocked(String),

    #[error("failed to spawn assistant subprocess: {0}")]
    SubprocessSpawnFailed(String),

    #[error("assistant produced no output for {0} seconds")]
    AssistantTimeout(u64),

    #[error("stream record exceeded the {limit} byte cap and was dropped")]
    ChunkTooLarge { limit: usize },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("subscriber lagged behind and was dropped")]
    SubscriberLagged,

    #[error("assistant exited with code {code}: {stderr}")]
    AssistantFailed { code: i32, stderr: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Lookup miss for a task id or name.
    pub fn task_not_found(task: impl std::fmt::Display) -> Self {
        Self::Validation(format!("task not found: {task}"))
    }

    /// Whether the executor may recover from this error and keep looping.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChunkTooLarge { .. } | Self::StorageUnavailable(_) | Self::Conflict(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
