//! Persistence gateway port.
//!
//! The store is the single enforcement point for the queue/summary invariant:
//! every JSON-valued column is edited through `mutate`, a read-modify-write
//! round that aborts on concurrent writes. Interaction appends and token
//! increments are conflict-free by construction.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{Interaction, InteractionKind, Task};

/// Closure applied inside a `mutate` round. May be re-invoked on a fresh row
/// when the optimistic write loses a race, so it must be idempotent over its
/// captured state.
pub type MutateFn<'a> = &'a (dyn Fn(&mut Task) -> EngineResult<()> + Send + Sync);

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> EngineResult<()>;

    async fn get_task(&self, id: Uuid) -> EngineResult<Option<Task>>;

    async fn get_task_by_name(&self, name: &str) -> EngineResult<Option<Task>>;

    async fn list_tasks(&self) -> EngineResult<Vec<Task>>;

    /// Tasks in an active status (pending, running, paused, testing).
    async fn list_active(&self) -> EngineResult<Vec<Task>>;

    /// Read the task row, apply `apply`, and write it back atomically.
    ///
    /// Retried up to three times on a write conflict; surfaces
    /// `EngineError::Conflict` after that. Returns the task as written.
    async fn mutate(&self, id: Uuid, apply: MutateFn<'_>) -> EngineResult<Task>;

    /// Delete the task row and all of its interactions.
    async fn delete_task(&self, id: Uuid) -> EngineResult<()>;

    /// Append one interaction. Write-only; never conflicts with `mutate`.
    async fn append_interaction(&self, interaction: &Interaction) -> EngineResult<Uuid>;

    /// Additive bump of `total_tokens_used`. Commutative, never conflicts.
    async fn increment_tokens(&self, id: Uuid, delta: u64) -> EngineResult<()>;

    /// Full ordered transcript for a task.
    async fn list_interactions(&self, task_id: Uuid) -> EngineResult<Vec<Interaction>>;

    async fn count_interactions(
        &self,
        task_id: Uuid,
        kind: InteractionKind,
    ) -> EngineResult<u64>;
}
