//! Command-based verification gate.
//!
//! Runs a configured shell command (typically the project's test suite) in
//! the task's workspace and maps the exit status to a verdict. Stays a thin
//! collaborator: it neither generates tests nor interprets their output.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::Task;
use crate::domain::ports::{TestGate, TestVerdict};

#[derive(Debug, Clone)]
pub struct CommandTestGate {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTestGate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TestGate for CommandTestGate {
    async fn verify(&self, task: &Task) -> EngineResult<TestVerdict> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = task.worktree_path.as_ref().or(task.root_path.as_ref()) {
            cmd.current_dir(dir);
        }

        info!(task_id = %task.id, program = %self.program, "running verification command");

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| EngineError::AssistantTimeout(self.timeout.as_secs()))?
            .map_err(|e| EngineError::SubprocessSpawnFailed(e.to_string()))?;

        let passed = output.status.success();
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(stderr.trim());
        }
        if !passed {
            warn!(task_id = %task.id, code = ?output.status.code(), "verification command failed");
        }

        Ok(TestVerdict {
            passed,
            output: text.trim().to_string(),
        })
    }
}
