//! Per-task user-input queue.
//!
//! Human messages always take priority over auto-generated turns. The queue
//! and its `user_input_pending` summary flag live in the task row and move
//! together through the store's read-modify-write mutation, which removes the
//! race class the queue exists to solve.

use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ImageAttachment, Task, UserInputEntry};
use crate::domain::ports::{Clock, TaskStore};

/// Snapshot of a task's queue for inspection.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub processed: usize,
    pub last_entries: Vec<UserInputEntry>,
}

pub struct UserInputQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl UserInputQueue {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append an entry and raise the pending flag atomically.
    ///
    /// Identical texts are not deduplicated: every send becomes its own
    /// entry, each consumed exactly once.
    pub async fn push(
        &self,
        task_id: Uuid,
        text: &str,
        images: Vec<ImageAttachment>,
    ) -> EngineResult<UserInputEntry> {
        let now = self.clock.now();
        let entry = UserInputEntry::new(text, now).with_images(images);
        let pushed = entry.clone();

        self.store
            .mutate(task_id, &move |task: &mut Task| {
                task.user_input_queue.push(entry.clone());
                task.refresh_input_pending();
                Ok(())
            })
            .await?;

        info!(task_id = %task_id, "user input queued");
        Ok(pushed)
    }

    /// Pop the oldest unprocessed entry, marking it processed and refreshing
    /// the pending flag in the same mutation.
    pub async fn pop_unprocessed(&self, task_id: Uuid) -> EngineResult<Option<UserInputEntry>> {
        let popped: Arc<Mutex<Option<UserInputEntry>>> = Arc::new(Mutex::new(None));
        let slot = popped.clone();

        self.store
            .mutate(task_id, &move |task: &mut Task| {
                // The mutation may re-run on a conflict; overwrite the slot
                // so only the final attempt's entry survives.
                let mut taken = None;
                if let Some(entry) = task.user_input_queue.iter_mut().find(|e| !e.processed) {
                    entry.processed = true;
                    taken = Some(entry.clone());
                }
                task.refresh_input_pending();
                *slot.lock().unwrap() = taken;
                Ok(())
            })
            .await?;

        let entry = popped.lock().unwrap().take();
        if let Some(entry) = &entry {
            debug!(task_id = %task_id, entry_id = %entry.id, "user input dispatched");
        }
        Ok(entry)
    }

    /// Fast path: reads the summary flag without loading the queue.
    pub async fn has_unprocessed(&self, task_id: Uuid) -> EngineResult<bool> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        Ok(task.user_input_pending)
    }

    /// Drop processed entries to keep the JSON column bounded.
    pub async fn clear_processed(&self, task_id: Uuid) -> EngineResult<usize> {
        let cleared = Arc::new(Mutex::new(0usize));
        let slot = cleared.clone();

        self.store
            .mutate(task_id, &move |task: &mut Task| {
                let before = task.user_input_queue.len();
                task.user_input_queue.retain(|e| !e.processed);
                task.refresh_input_pending();
                *slot.lock().unwrap() = before - task.user_input_queue.len();
                Ok(())
            })
            .await?;

        let count = *cleared.lock().unwrap();
        Ok(count)
    }

    pub async fn status(&self, task_id: Uuid) -> EngineResult<QueueStatus> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let pending = task
            .user_input_queue
            .iter()
            .filter(|e| !e.processed)
            .count();
        let total = task.user_input_queue.len();
        let last_entries = task
            .user_input_queue
            .iter()
            .rev()
            .take(5)
            .cloned()
            .collect();
        Ok(QueueStatus {
            total,
            pending,
            processed: total - pending,
            last_entries,
        })
    }
}
