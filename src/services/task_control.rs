//! Task-control surface: the thin facade the front-end drives.
//!
//! Validates each operation against the lifecycle state machine, mutates the
//! task row through the persistence gateway, and signals or tears down the
//! per-task executor loop.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    CriteriaConfig, ImageAttachment, Interaction, ProjectAccess, ProjectAttachment, Task,
    TaskStatus,
};
use crate::domain::ports::TaskStore;
use crate::services::criteria_analyzer::CriteriaAnalyzer;
use crate::services::event_fanout::{EventFanOut, TaskEvent, TaskEventStream};
use crate::services::input_queue::{QueueStatus, UserInputQueue};
use crate::services::prompt;
use crate::services::task_executor::TaskExecutor;
use crate::services::workspace::{slug, WorkspaceManager};

/// Everything needed to create a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub project_context: Option<String>,
    pub projects: Vec<ProjectAttachment>,
    pub root_path: Option<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub criteria: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub chat_mode: bool,
    /// Spawn the executor right away instead of waiting for `start`.
    pub auto_start: bool,
    /// Ask the criteria analyzer to derive criteria from the description.
    /// Off by default: it costs a full assistant round-trip.
    pub extract_criteria: bool,
}

/// Cap raises accepted alongside `recover`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverOptions {
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
}

pub struct TaskControl {
    store: Arc<dyn TaskStore>,
    workspace: Arc<WorkspaceManager>,
    executor: Arc<TaskExecutor>,
    queue: Arc<UserInputQueue>,
    fanout: Arc<EventFanOut>,
    criteria: Arc<CriteriaAnalyzer>,
}

impl TaskControl {
    pub fn new(
        store: Arc<dyn TaskStore>,
        workspace: Arc<WorkspaceManager>,
        executor: Arc<TaskExecutor>,
        queue: Arc<UserInputQueue>,
        fanout: Arc<EventFanOut>,
        criteria: Arc<CriteriaAnalyzer>,
    ) -> Self {
        Self {
            store,
            workspace,
            executor,
            queue,
            fanout,
            criteria,
        }
    }

    /// Create a task: unique name, provisioned workspace, `Pending` row.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: CreateTaskRequest) -> EngineResult<Task> {
        if request.name.trim().is_empty() {
            return Err(EngineError::Validation("task name cannot be empty".into()));
        }
        if self.store.get_task_by_name(&request.name).await?.is_some() {
            return Err(EngineError::Validation(format!(
                "task with name '{}' already exists",
                request.name
            )));
        }

        let mut criteria_config = CriteriaConfig {
            criteria: request.criteria.clone(),
            max_tokens: request.max_tokens,
            ..Default::default()
        };
        if let Some(max_iterations) = request.max_iterations {
            criteria_config.max_iterations = max_iterations;
        }
        if criteria_config.criteria.is_none() {
            if request.extract_criteria {
                let extraction = self.criteria.extract(&request.description).await;
                criteria_config.criteria = extraction.criteria;
                criteria_config.warning = extraction.warning;
            }
            if criteria_config.criteria.is_none() && criteria_config.warning.is_none() {
                criteria_config.warning = Some(format!(
                    "no ending criteria provided; using default completion detection \
                     (max iterations: {})",
                    criteria_config.max_iterations
                ));
            }
        }

        let mut task = Task::new(&request.name, &request.owner, &request.description)
            .with_criteria(criteria_config)
            .with_chat_mode(request.chat_mode);
        task.project_context = request.project_context.clone();
        task.projects = request.projects.clone();

        // Workspace isolation for the main repository.
        if let Some(root_path) = &request.root_path {
            let branch = request
                .branch
                .clone()
                .unwrap_or_else(|| format!("task/{}", slug(&request.name)));
            self.ensure_branch_free(root_path, &branch).await?;

            let provisioned = self
                .workspace
                .provision(
                    &request.name,
                    root_path,
                    request.base_branch.as_deref(),
                    Some(&branch),
                )
                .await?;

            if provisioned.fallback {
                // No worktree support: the root checkout is the workspace,
                // and only one active task may own it.
                let active = self.store.list_active().await?;
                if active.iter().any(|t| t.root_path.as_deref() == Some(root_path.as_str())) {
                    return Err(EngineError::BranchInUse {
                        root: root_path.clone(),
                        branch: provisioned.branch,
                    });
                }
            }

            task.root_path = Some(root_path.clone());
            task.branch = Some(provisioned.branch);
            task.base_branch = Some(provisioned.base_branch);
            if !provisioned.fallback {
                task.worktree_path = Some(provisioned.path);
            }
        }

        // Per-project isolation for write-access attachments.
        if task.projects.iter().any(|p| p.access == ProjectAccess::Write) {
            let provisioned = self
                .workspace
                .multi_provision(&request.name, &task.projects)
                .await?;
            for (project_name, workspace) in provisioned {
                if let Some(project) = task.projects.iter_mut().find(|p| p.name == project_name) {
                    project.extra.insert(
                        "worktree_path".to_string(),
                        serde_json::Value::String(workspace.path),
                    );
                    project.extra.insert(
                        "branch".to_string(),
                        serde_json::Value::String(workspace.branch),
                    );
                }
            }
        }

        self.store.create_task(&task).await?;
        info!(task_id = %task.id, "task created");

        if request.auto_start {
            self.start(&request.name).await?;
            return self.require(&request.name).await;
        }
        Ok(task)
    }

    /// Start a pending task.
    pub async fn start(&self, name: &str) -> EngineResult<()> {
        let task = self.require(name).await?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::Validation(format!(
                "task can only be started from pending (currently {})",
                task.status.as_str()
            )));
        }
        self.set_status(task.id, TaskStatus::Running).await?;
        self.executor.spawn(task.id).await;
        Ok(())
    }

    /// Stop a live task. Returns once the executor has wound down, which the
    /// assistant client bounds at its two-second drain window.
    pub async fn stop(&self, name: &str) -> EngineResult<()> {
        let task = self.require(name).await?;
        if !matches!(
            task.status,
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Testing
        ) {
            return Err(EngineError::Validation(format!(
                "task can only be stopped from running/paused/testing (currently {})",
                task.status.as_str()
            )));
        }
        self.set_status(task.id, TaskStatus::Stopped).await?;
        self.executor.request_stop(task.id).await;
        self.store
            .mutate(task.id, &|t: &mut Task| {
                t.subprocess_id = None;
                Ok(())
            })
            .await?;
        info!(task_id = %task.id, "task stopped");
        Ok(())
    }

    /// Resume a stopped task with its existing assistant session.
    pub async fn resume(&self, name: &str) -> EngineResult<()> {
        let task = self.require(name).await?;
        if task.status != TaskStatus::Stopped {
            return Err(EngineError::Validation(format!(
                "task can only be resumed from stopped (currently {})",
                task.status.as_str()
            )));
        }
        self.set_status(task.id, TaskStatus::Running).await?;
        self.executor.spawn(task.id).await;
        Ok(())
    }

    /// Recover a stopped or terminal task: discard the assistant session,
    /// keep the interaction log, and return to `Running`. Caps may be raised
    /// at the same time.
    pub async fn recover(&self, name: &str, options: RecoverOptions) -> EngineResult<()> {
        let task = self.require(name).await?;
        if !(task.status.is_terminal() || task.status == TaskStatus::Stopped) {
            return Err(EngineError::Validation(format!(
                "task can only be recovered from a terminal or stopped state (currently {})",
                task.status.as_str()
            )));
        }

        // Give the fresh session context about the interrupted conversation.
        let interactions = self.store.list_interactions(task.id).await?;
        if !interactions.is_empty() {
            let message = prompt::recovery_message(&interactions);
            let interaction = Interaction::system_message(task.id, message);
            self.store.append_interaction(&interaction).await?;
            self.fanout
                .publish(task.id, TaskEvent::Interaction(interaction))
                .await;
        }

        let from = task.status;
        self.store
            .mutate(task.id, &move |t: &mut Task| {
                t.assistant_session_id = None;
                t.error_message = None;
                t.completed_at = None;
                if let Some(max_iterations) = options.max_iterations {
                    t.criteria_config.max_iterations = max_iterations;
                }
                if let Some(max_tokens) = options.max_tokens {
                    t.criteria_config.max_tokens = Some(max_tokens);
                }
                t.transition_to(TaskStatus::Running)
                    .map_err(EngineError::Validation)?;
                Ok(())
            })
            .await?;
        self.fanout
            .publish(
                task.id,
                TaskEvent::StatusChange {
                    from,
                    to: TaskStatus::Running,
                },
            )
            .await;

        self.executor.spawn(task.id).await;
        info!(task_id = %task.id, "task recovering with a fresh assistant session");
        Ok(())
    }

    /// Queue user input. A pending task is implicitly started; a running task
    /// is signalled to dispatch the entry right away.
    pub async fn send_input(
        &self,
        name: &str,
        text: &str,
        images: Vec<ImageAttachment>,
    ) -> EngineResult<()> {
        let task = self.require(name).await?;
        if task.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "task is {} and no longer accepts input",
                task.status.as_str()
            )));
        }

        self.queue.push(task.id, text, images).await?;

        match task.status {
            TaskStatus::Pending => {
                self.start(name).await?;
            }
            TaskStatus::Running | TaskStatus::Paused => {
                // Guard against the scheduled iteration double-dispatching
                // while the out-of-band signal is in flight.
                self.store
                    .mutate(task.id, &|t: &mut Task| {
                        t.immediate_processing_active = true;
                        Ok(())
                    })
                    .await?;
                self.executor.signal_input(task.id).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Delete a task unconditionally: kill the loop, reclaim the workspace
    /// (commit-first), drop the rows, and close all subscribers.
    ///
    /// A reclaim that cannot commit pending changes blocks deletion unless
    /// `force` is set.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn delete(&self, name: &str, force: bool) -> EngineResult<()> {
        let task = self.require(name).await?;

        self.executor.kill(task.id).await;

        if let (Some(root_path), Some(worktree_path)) = (&task.root_path, &task.worktree_path) {
            self.workspace
                .reclaim(
                    root_path,
                    worktree_path,
                    task.branch.as_deref(),
                    task.base_branch.as_deref(),
                    force,
                )
                .await?;
        }

        // Project workspaces recorded at creation time.
        for project in &task.projects {
            if let Some(serde_json::Value::String(path)) = project.extra.get("worktree_path") {
                let branch = match project.extra.get("branch") {
                    Some(serde_json::Value::String(branch)) => Some(branch.as_str()),
                    _ => None,
                };
                if let Err(e) = self
                    .workspace
                    .reclaim(&project.path, path, branch, None, force)
                    .await
                {
                    if !force {
                        return Err(e);
                    }
                    warn!(project = %project.name, error = %e, "project workspace reclaim failed");
                }
            }
        }

        self.store.delete_task(task.id).await?;
        self.fanout.close(task.id).await;
        info!(task_id = %task.id, "task deleted");
        Ok(())
    }

    /// Live event stream for a task, starting now. Hydrate with
    /// `fetch_transcript` before subscribing.
    pub async fn subscribe(&self, name: &str) -> EngineResult<TaskEventStream> {
        let task = self.require(name).await?;
        Ok(self.fanout.subscribe(task.id).await)
    }

    pub async fn fetch_transcript(&self, name: &str) -> EngineResult<Vec<Interaction>> {
        let task = self.require(name).await?;
        self.store.list_interactions(task.id).await
    }

    pub async fn get(&self, name: &str) -> EngineResult<Task> {
        self.require(name).await
    }

    pub async fn list(&self) -> EngineResult<Vec<Task>> {
        self.store.list_tasks().await
    }

    pub async fn queue_status(&self, name: &str) -> EngineResult<QueueStatus> {
        let task = self.require(name).await?;
        self.queue.status(task.id).await
    }

    async fn require(&self, name: &str) -> EngineResult<Task> {
        self.store
            .get_task_by_name(name)
            .await?
            .ok_or_else(|| EngineError::task_not_found(name))
    }

    /// At most one active task per (root, branch) pair.
    async fn ensure_branch_free(&self, root_path: &str, branch: &str) -> EngineResult<()> {
        let active = self.store.list_active().await?;
        let clash = active.iter().any(|t| {
            t.root_path.as_deref() == Some(root_path) && t.branch.as_deref() == Some(branch)
        });
        if clash {
            return Err(EngineError::BranchInUse {
                root: root_path.to_string(),
                branch: branch.to_string(),
            });
        }
        Ok(())
    }

    async fn set_status(&self, task_id: Uuid, to: TaskStatus) -> EngineResult<()> {
        let from_slot = Arc::new(std::sync::Mutex::new(None));
        let slot = from_slot.clone();
        self.store
            .mutate(task_id, &move |t: &mut Task| {
                *slot.lock().unwrap() = Some(t.status);
                if t.status == to {
                    return Ok(());
                }
                t.transition_to(to).map_err(EngineError::Validation)?;
                Ok(())
            })
            .await?;
        let from = from_slot.lock().unwrap().take().unwrap_or(to);
        if from != to {
            self.fanout
                .publish(task_id, TaskEvent::StatusChange { from, to })
                .await;
        }
        Ok(())
    }
}
