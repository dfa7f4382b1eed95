//! Task domain model.
//!
//! A task is one automation unit: a natural-language objective executed as a
//! multi-turn conversation with the assistant inside an isolated workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::interaction::ImageAttachment;

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, workspace provisioned, loop not yet spawned
    Pending,
    /// Executor loop is live
    Running,
    /// Transient: between assistant turns while the next user turn is chosen
    Paused,
    /// Stopped by the user; resumable with the same assistant session
    Stopped,
    /// Verification phase after criteria were met
    Testing,
    /// Verification passed
    Completed,
    /// Non-recoverable execution error
    Failed,
    /// Completion criteria met
    Finished,
    /// Iteration or token cap tripped
    Exhausted,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Exhausted => "exhausted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "testing" => Some(Self::Testing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "finished" => Some(Self::Finished),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }

    /// Terminal states reject start/resume/send_input; only recover or delete.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Finished | Self::Exhausted
        )
    }

    /// Active states participate in the per-(root, branch) exclusivity check.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Paused | Self::Testing
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<TaskStatus> {
        match self {
            Self::Pending => vec![Self::Running],
            Self::Running => vec![
                Self::Paused,
                Self::Stopped,
                Self::Testing,
                Self::Finished,
                Self::Exhausted,
                Self::Failed,
            ],
            Self::Paused => vec![Self::Running, Self::Stopped],
            Self::Stopped => vec![Self::Running],
            Self::Testing => vec![Self::Completed, Self::Failed, Self::Stopped],
            // Terminal states are only left through recover
            Self::Completed | Self::Failed | Self::Finished | Self::Exhausted => {
                vec![Self::Running]
            }
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Read/write access a task holds on an attached project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectAccess {
    Read,
    Write,
}

/// One project attached to a task at creation time.
///
/// Write-access projects get their own isolated checkout; read-only projects
/// are referenced in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAttachment {
    pub name: String,
    pub path: String,
    pub access: ProjectAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Unknown keys are preserved on write but ignored by the engine.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Completion criteria and resource envelope for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_max_iterations() -> u32 {
    20
}

impl Default for CriteriaConfig {
    fn default() -> Self {
        Self {
            criteria: None,
            max_iterations: default_max_iterations(),
            max_tokens: None,
            warning: None,
            extra: HashMap::new(),
        }
    }
}

/// One entry in a task's user-input queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInputEntry {
    pub id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
}

impl UserInputEntry {
    pub fn new(text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            images: Vec::new(),
            timestamp: now,
            processed: false,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

/// A single automation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// User-supplied name, unique system-wide
    pub name: String,
    /// Opaque owner id
    pub owner: String,
    /// Natural-language objective
    pub description: String,
    /// Task-level context appended to the initial prompt
    pub project_context: Option<String>,
    /// Attached projects, ordered
    pub projects: Vec<ProjectAttachment>,
    /// Main repository root, if any
    pub root_path: Option<String>,
    /// Task branch inside the repository
    pub branch: Option<String>,
    /// Branch the task branch was created from
    pub base_branch: Option<String>,
    /// Isolated checkout path; present iff a workspace is held
    pub worktree_path: Option<String>,
    /// Assistant session id, set exactly once on the first assistant turn
    pub assistant_session_id: Option<String>,
    /// Current status
    pub status: TaskStatus,
    /// Live subprocess id, if a turn is in flight
    pub subprocess_id: Option<u32>,
    /// Guard against double dispatch when input triggers an immediate turn
    pub immediate_processing_active: bool,
    /// When true the loop blocks for human input instead of auto-responding
    pub chat_mode: bool,
    /// Criteria and resource envelope
    pub criteria_config: CriteriaConfig,
    /// Cumulative assistant output tokens
    pub total_tokens_used: u64,
    /// Pending and processed user input
    pub user_input_queue: Vec<UserInputEntry>,
    /// Summary index: true iff any queue entry is unprocessed
    pub user_input_pending: bool,
    /// Result summary, set on successful termination
    pub summary: Option<String>,
    /// Short human-readable failure cause
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Version for optimistic locking
    pub version: u64,
}

impl Task {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            description: description.into(),
            project_context: None,
            projects: Vec::new(),
            root_path: None,
            branch: None,
            base_branch: None,
            worktree_path: None,
            assistant_session_id: None,
            status: TaskStatus::default(),
            subprocess_id: None,
            immediate_processing_active: false,
            chat_mode: false,
            criteria_config: CriteriaConfig::default(),
            total_tokens_used: 0,
            user_input_queue: Vec::new(),
            user_input_pending: false,
            summary: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 1,
        }
    }

    pub fn with_projects(mut self, projects: Vec<ProjectAttachment>) -> Self {
        self.projects = projects;
        self
    }

    pub fn with_criteria(mut self, criteria_config: CriteriaConfig) -> Self {
        self.criteria_config = criteria_config;
        self
    }

    pub fn with_root(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    pub fn with_chat_mode(mut self, chat_mode: bool) -> Self {
        self.chat_mode = chat_mode;
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, stamping timestamps.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        if new_status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Recompute the `user_input_pending` summary from the queue.
    ///
    /// Must be called inside the same store mutation as any queue edit.
    pub fn refresh_input_pending(&mut self) {
        self.user_input_pending = self.user_input_queue.iter().any(|e| !e.processed);
    }

    /// An empty description is legal (the criteria warning flags it); only
    /// the name is required.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("task name cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Running.is_active());
        assert!(TaskStatus::Paused.is_active());
        assert!(TaskStatus::Testing.is_active());
        assert!(!TaskStatus::Stopped.is_active());

        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Exhausted.is_terminal());
        assert!(!TaskStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("demo", "user-1", "Write a greeting script");
        assert_eq!(task.status, TaskStatus::Pending);

        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Paused).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Finished).unwrap();
        assert!(task.is_terminal());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_only_recover() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Finished,
            TaskStatus::Exhausted,
        ] {
            assert_eq!(status.valid_transitions(), vec![TaskStatus::Running]);
        }
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut task = Task::new("demo", "user-1", "desc");
        let err = task.transition_to(TaskStatus::Stopped).unwrap_err();
        assert!(err.contains("pending"));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_input_pending_summary_tracks_queue() {
        let mut task = Task::new("demo", "user-1", "desc");
        assert!(!task.user_input_pending);

        task.user_input_queue
            .push(UserInputEntry::new("use tabs", Utc::now()));
        task.refresh_input_pending();
        assert!(task.user_input_pending);

        task.user_input_queue[0].processed = true;
        task.refresh_input_pending();
        assert!(!task.user_input_pending);
    }

    #[test]
    fn test_criteria_config_round_trip_preserves_extra() {
        let json = r#"{"criteria":"build passes","max_iterations":5,"future_knob":42}"#;
        let config: CriteriaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.extra.get("future_knob").unwrap(), 42);

        let back = serde_json::to_string(&config).unwrap();
        assert!(back.contains("future_knob"));
    }

    #[test]
    fn test_criteria_config_defaults() {
        let config: CriteriaConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_iterations, 20);
        assert!(config.criteria.is_none());
        assert!(config.max_tokens.is_none());
    }
}
