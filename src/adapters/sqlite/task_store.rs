//! SQLite implementation of the persistence gateway.
//!
//! All JSON-valued columns go through `mutate` as a read-modify-write round
//! guarded by the row version. `total_tokens_used` is deliberately excluded
//! from the `mutate` write set: it is only changed through the additive
//! `increment_tokens`, so counter bumps never lose against row mutations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    CriteriaConfig, ImageAttachment, Interaction, InteractionKind, ProjectAttachment, Task,
    TaskStatus, ToolCall, UserInputEntry,
};
use crate::domain::ports::{MutateFn, TaskStore};

const MUTATE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_row(&self, id: Uuid) -> EngineResult<Option<TaskRow>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Write `task` back, expecting the stored row to still be at
    /// `expected_version`. Returns false when the optimistic check fails.
    async fn write_versioned(&self, task: &Task, expected_version: u64) -> EngineResult<bool> {
        let projects_json = serde_json::to_string(&task.projects)?;
        let criteria_json = serde_json::to_string(&task.criteria_config)?;
        let queue_json = serde_json::to_string(&task.user_input_queue)?;

        let result = sqlx::query(
            r#"UPDATE tasks SET
                   name = ?, owner = ?, description = ?, project_context = ?, projects = ?,
                   root_path = ?, branch = ?, base_branch = ?, worktree_path = ?,
                   assistant_session_id = ?, status = ?, subprocess_id = ?,
                   immediate_processing_active = ?, chat_mode = ?, criteria_config = ?,
                   user_input_queue = ?, user_input_pending = ?, summary = ?,
                   error_message = ?, updated_at = ?, completed_at = ?, version = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(&task.name)
        .bind(&task.owner)
        .bind(&task.description)
        .bind(&task.project_context)
        .bind(&projects_json)
        .bind(&task.root_path)
        .bind(&task.branch)
        .bind(&task.base_branch)
        .bind(&task.worktree_path)
        .bind(&task.assistant_session_id)
        .bind(task.status.as_str())
        .bind(task.subprocess_id.map(|p| p as i64))
        .bind(task.immediate_processing_active)
        .bind(task.chat_mode)
        .bind(&criteria_json)
        .bind(&queue_json)
        .bind(task.user_input_pending)
        .bind(&task.summary)
        .bind(&task.error_message)
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.version as i64)
        .bind(task.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: &Task) -> EngineResult<()> {
        let projects_json = serde_json::to_string(&task.projects)?;
        let criteria_json = serde_json::to_string(&task.criteria_config)?;
        let queue_json = serde_json::to_string(&task.user_input_queue)?;

        sqlx::query(
            r#"INSERT INTO tasks (id, name, owner, description, project_context, projects,
                   root_path, branch, base_branch, worktree_path, assistant_session_id,
                   status, subprocess_id, immediate_processing_active, chat_mode,
                   criteria_config, total_tokens_used, user_input_queue, user_input_pending,
                   summary, error_message, created_at, updated_at, completed_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(&task.owner)
        .bind(&task.description)
        .bind(&task.project_context)
        .bind(&projects_json)
        .bind(&task.root_path)
        .bind(&task.branch)
        .bind(&task.base_branch)
        .bind(&task.worktree_path)
        .bind(&task.assistant_session_id)
        .bind(task.status.as_str())
        .bind(task.subprocess_id.map(|p| p as i64))
        .bind(task.immediate_processing_active)
        .bind(task.chat_mode)
        .bind(&criteria_json)
        .bind(task.total_tokens_used as i64)
        .bind(&queue_json)
        .bind(task.user_input_pending)
        .bind(&task.summary)
        .bind(&task.error_message)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngineError::Validation(format!("task name '{}' already exists", task.name))
            }
            _ => e.into(),
        })?;

        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> EngineResult<Option<Task>> {
        match self.fetch_row(id).await? {
            Some(row) => Ok(Some(row.try_into()?)),
            None => Ok(None),
        }
    }

    async fn get_task_by_name(&self, name: &str) -> EngineResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> EngineResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_active(&self) -> EngineResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE status IN ('pending', 'running', 'paused', 'testing')
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mutate(&self, id: Uuid, apply: MutateFn<'_>) -> EngineResult<Task> {
        for attempt in 1..=MUTATE_ATTEMPTS {
            let row = self
                .fetch_row(id)
                .await?
                .ok_or_else(|| EngineError::task_not_found(id))?;
            let mut task: Task = row.try_into()?;
            let expected_version = task.version;

            apply(&mut task)?;
            task.version = expected_version + 1;
            task.updated_at = Utc::now();

            if self.write_versioned(&task, expected_version).await? {
                return Ok(task);
            }

            warn!(task_id = %id, attempt, "task row changed under mutation, retrying");
        }
        Err(EngineError::Conflict(id))
    }

    async fn delete_task(&self, id: Uuid) -> EngineResult<()> {
        // ON DELETE CASCADE removes the interactions.
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::task_not_found(id));
        }
        Ok(())
    }

    async fn append_interaction(&self, interaction: &Interaction) -> EngineResult<Uuid> {
        let tools_json = serde_json::to_string(&interaction.tools)?;
        let attachments_json = serde_json::to_string(&interaction.attachments)?;

        sqlx::query(
            r#"INSERT INTO interactions (id, task_id, kind, content, input_tokens,
                   output_tokens, cache_creation_tokens, cache_read_tokens, cost,
                   duration_ms, tools, attachments, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(interaction.id.to_string())
        .bind(interaction.task_id.to_string())
        .bind(interaction.kind.as_str())
        .bind(&interaction.content)
        .bind(interaction.input_tokens.map(|v| v as i64))
        .bind(interaction.output_tokens.map(|v| v as i64))
        .bind(interaction.cache_creation_tokens.map(|v| v as i64))
        .bind(interaction.cache_read_tokens.map(|v| v as i64))
        .bind(interaction.cost)
        .bind(interaction.duration_ms.map(|v| v as i64))
        .bind(&tools_json)
        .bind(&attachments_json)
        .bind(interaction.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(interaction.id)
    }

    async fn increment_tokens(&self, id: Uuid, delta: u64) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET total_tokens_used = total_tokens_used + ? WHERE id = ?",
        )
        .bind(delta as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::task_not_found(id));
        }
        Ok(())
    }

    async fn list_interactions(&self, task_id: Uuid) -> EngineResult<Vec<Interaction>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(
            "SELECT * FROM interactions WHERE task_id = ? ORDER BY created_at, id",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_interactions(
        &self,
        task_id: Uuid,
        kind: InteractionKind,
    ) -> EngineResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM interactions WHERE task_id = ? AND kind = ?")
                .bind(task_id.to_string())
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    name: String,
    owner: String,
    description: String,
    project_context: Option<String>,
    projects: String,
    root_path: Option<String>,
    branch: Option<String>,
    base_branch: Option<String>,
    worktree_path: Option<String>,
    assistant_session_id: Option<String>,
    status: String,
    subprocess_id: Option<i64>,
    immediate_processing_active: bool,
    chat_mode: bool,
    criteria_config: String,
    total_tokens_used: i64,
    user_input_queue: String,
    user_input_pending: bool,
    summary: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = EngineError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let projects: Vec<ProjectAttachment> = serde_json::from_str(&row.projects)?;
        let criteria_config: CriteriaConfig = serde_json::from_str(&row.criteria_config)?;
        let user_input_queue: Vec<UserInputEntry> = serde_json::from_str(&row.user_input_queue)?;
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| EngineError::Serialization(format!("unknown status '{}'", row.status)))?;

        Ok(Task {
            id: parse_uuid(&row.id)?,
            name: row.name,
            owner: row.owner,
            description: row.description,
            project_context: row.project_context,
            projects,
            root_path: row.root_path,
            branch: row.branch,
            base_branch: row.base_branch,
            worktree_path: row.worktree_path,
            assistant_session_id: row.assistant_session_id,
            status,
            subprocess_id: row.subprocess_id.map(|p| p as u32),
            immediate_processing_active: row.immediate_processing_active,
            chat_mode: row.chat_mode,
            criteria_config,
            total_tokens_used: row.total_tokens_used as u64,
            user_input_queue,
            user_input_pending: row.user_input_pending,
            summary: row.summary,
            error_message: row.error_message,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            version: row.version as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InteractionRow {
    id: String,
    task_id: String,
    kind: String,
    content: String,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_creation_tokens: Option<i64>,
    cache_read_tokens: Option<i64>,
    cost: Option<f64>,
    duration_ms: Option<i64>,
    tools: String,
    attachments: String,
    created_at: String,
}

impl TryFrom<InteractionRow> for Interaction {
    type Error = EngineError;

    fn try_from(row: InteractionRow) -> Result<Self, Self::Error> {
        let tools: Vec<ToolCall> = serde_json::from_str(&row.tools)?;
        let attachments: Vec<ImageAttachment> = serde_json::from_str(&row.attachments)?;
        let kind = InteractionKind::from_str(&row.kind)
            .ok_or_else(|| EngineError::Serialization(format!("unknown kind '{}'", row.kind)))?;

        Ok(Interaction {
            id: parse_uuid(&row.id)?,
            task_id: parse_uuid(&row.task_id)?,
            kind,
            content: row.content,
            input_tokens: row.input_tokens.map(|v| v as u64),
            output_tokens: row.output_tokens.map(|v| v as u64),
            cache_creation_tokens: row.cache_creation_tokens.map(|v| v as u64),
            cache_read_tokens: row.cache_read_tokens.map(|v| v as u64),
            cost: row.cost,
            duration_ms: row.duration_ms.map(|v| v as u64),
            tools,
            attachments,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> EngineResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| EngineError::Serialization(format!("invalid uuid: {e}")))
}

fn parse_timestamp(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Serialization(format!("invalid timestamp: {e}")))
}
