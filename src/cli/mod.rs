//! Command-line front-end for the engine.
//!
//! Control operations act through the persistence layer, so `stop` and
//! `send` issued from a second process are observed by the running loop at
//! its next decision point; `watch` tails the transcript from the database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::assistant::CliAssistantClient;
use crate::adapters::sqlite::{apply_pending, open_pool, SqliteTaskStore};
use crate::domain::models::{
    Interaction, ProjectAccess, ProjectAttachment, ProjectSpec, TaskStatus,
};
use crate::domain::ports::{AssistantClient, Clock, SystemClock, TaskStore};
use crate::infrastructure::{init_logging, EngineConfig};
use crate::services::{
    CreateTaskRequest, CriteriaAnalyzer, EventFanOut, ExecutorConfig, RecoverOptions, TaskControl,
    TaskExecutor, UserInputQueue, WorkspaceManager,
};

#[derive(Parser)]
#[command(name = "taskpilot", about = "Drive a CLI coding assistant through long-running tasks")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task (optionally start it right away)
    Create {
        name: String,
        description: String,
        #[arg(long, default_value = "local")]
        owner: String,
        /// Repository root to isolate a workspace in
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        /// Attach a project as name=path[:ro]
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        criteria: Option<String>,
        /// Derive criteria from the description via the assistant
        #[arg(long)]
        extract_criteria: bool,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        max_tokens: Option<u64>,
        /// Block for human input instead of auto-responding
        #[arg(long)]
        chat: bool,
        /// Start immediately and stay attached until the task terminates
        #[arg(long)]
        start: bool,
    },
    /// Start a pending task and stay attached
    Start { name: String },
    /// Stop a running task
    Stop { name: String },
    /// Resume a stopped task with its existing session
    Resume { name: String },
    /// Recover a failed/exhausted/stopped task with a fresh session
    Recover {
        name: String,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        max_tokens: Option<u64>,
    },
    /// Delete a task, its log, and its workspace
    Delete {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Queue a user message for a task
    Send { name: String, message: String },
    /// Tail a task's transcript
    Watch { name: String },
    /// Print a task's full transcript
    Transcript { name: String },
    /// List all tasks
    List,
    /// Show a task's input-queue status
    Queue { name: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;
    let _log_guard = init_logging(&config, None);
    let engine = build_engine(&config).await?;

    match cli.command {
        Command::Create {
            name,
            description,
            owner,
            root,
            branch,
            base_branch,
            projects,
            context,
            criteria,
            extract_criteria,
            max_iterations,
            max_tokens,
            chat,
            start,
        } => {
            let request = CreateTaskRequest {
                name: name.clone(),
                owner,
                description,
                project_context: context,
                projects: parse_projects(&projects)?,
                root_path: root,
                branch,
                base_branch,
                criteria,
                max_iterations,
                max_tokens,
                chat_mode: chat,
                auto_start: start,
                extract_criteria,
            };
            let task = engine.create(request).await?;
            println!("created task '{}' ({})", task.name, task.id);
            if let Some(warning) = &task.criteria_config.warning {
                println!("note: {warning}");
            }
            if start {
                attach(&engine, &name).await?;
            }
        }
        Command::Start { name } => {
            engine.start(&name).await?;
            println!("task '{name}' running");
            attach(&engine, &name).await?;
        }
        Command::Stop { name } => {
            engine.stop(&name).await?;
            println!("task '{name}' stopped");
        }
        Command::Resume { name } => {
            engine.resume(&name).await?;
            println!("task '{name}' resumed");
            attach(&engine, &name).await?;
        }
        Command::Recover {
            name,
            max_iterations,
            max_tokens,
        } => {
            engine
                .recover(
                    &name,
                    RecoverOptions {
                        max_iterations,
                        max_tokens,
                    },
                )
                .await?;
            println!("task '{name}' recovering with a fresh session");
            attach(&engine, &name).await?;
        }
        Command::Delete { name, force } => {
            engine.delete(&name, force).await?;
            println!("task '{name}' deleted");
        }
        Command::Send { name, message } => {
            engine.send_input(&name, &message, Vec::new()).await?;
            println!("input queued for '{name}'");
        }
        Command::Watch { name } => {
            attach(&engine, &name).await?;
        }
        Command::Transcript { name } => {
            for interaction in engine.fetch_transcript(&name).await? {
                print_interaction(&interaction);
            }
        }
        Command::List => {
            for task in engine.list().await? {
                println!(
                    "{:<28} {:<10} tokens={:<8} {}",
                    task.name,
                    task.status.as_str(),
                    task.total_tokens_used,
                    task.summary.as_deref().unwrap_or("")
                );
            }
        }
        Command::Queue { name } => {
            let status = engine.queue_status(&name).await?;
            println!(
                "{} queued, {} pending, {} processed",
                status.total, status.pending, status.processed
            );
            for entry in &status.last_entries {
                let state = if entry.processed { "processed" } else { "pending" };
                println!("  [{state}] {}", entry.text);
            }
        }
    }
    Ok(())
}

async fn build_engine(config: &EngineConfig) -> Result<Arc<TaskControl>> {
    let pool = open_pool(&config.database_url)
        .await
        .context("failed to open database")?;
    apply_pending(&pool)
        .await
        .context("failed to apply schema migrations")?;

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let assistant: Arc<dyn AssistantClient> =
        Arc::new(CliAssistantClient::with_command(&config.assistant_command));
    let queue = Arc::new(UserInputQueue::new(store.clone(), clock));
    let fanout = Arc::new(EventFanOut::default());
    let criteria = Arc::new(CriteriaAnalyzer::new(assistant.clone()));
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        assistant,
        queue.clone(),
        fanout.clone(),
        criteria.clone(),
        ExecutorConfig::default(),
    ));
    let workspace = Arc::new(WorkspaceManager::new(&config.isolated_subdir));

    Ok(Arc::new(TaskControl::new(
        store, workspace, executor, queue, fanout, criteria,
    )))
}

/// Tail the transcript from the database until the task terminates.
async fn attach(engine: &TaskControl, name: &str) -> Result<()> {
    let mut seen = 0usize;
    loop {
        let task = engine.get(name).await?;
        let transcript = engine.fetch_transcript(name).await?;
        for interaction in &transcript[seen.min(transcript.len())..] {
            print_interaction(interaction);
        }
        seen = transcript.len();

        if task.status.is_terminal() || task.status == TaskStatus::Stopped {
            println!("task '{name}' is {}", task.status.as_str());
            if let Some(error) = &task.error_message {
                println!("error: {error}");
            }
            if let Some(summary) = &task.summary {
                println!("summary: {summary}");
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn print_interaction(interaction: &Interaction) {
    let header = interaction.kind.as_str();
    let preview: String = interaction.content.chars().take(2000).collect();
    println!("--- {header} ({})", interaction.created_at.format("%H:%M:%S"));
    println!("{preview}");
}

/// Parse project attachments: `name=path[:ro]`, or an inline JSON project
/// descriptor (`{"name": ..., "paths": [...]}`).
fn parse_projects(specs: &[String]) -> Result<Vec<ProjectAttachment>> {
    let mut projects = Vec::new();
    for spec in specs {
        if spec.trim_start().starts_with('{') {
            let descriptor: ProjectSpec = serde_json::from_str(spec)
                .with_context(|| format!("project '{spec}' is not a valid descriptor"))?;
            let attachment = descriptor
                .to_attachment(ProjectAccess::Write)
                .with_context(|| format!("project '{}' has no paths", descriptor.name))?;
            projects.push(attachment);
            continue;
        }
        let (name, rest) = spec
            .split_once('=')
            .with_context(|| format!("project '{spec}' is not name=path[:ro]"))?;
        let (path, access) = match rest.strip_suffix(":ro") {
            Some(path) => (path, ProjectAccess::Read),
            None => (rest, ProjectAccess::Write),
        };
        projects.push(ProjectAttachment {
            name: name.to_string(),
            path: path.to_string(),
            access,
            context: None,
            extra: HashMap::new(),
        });
    }
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_projects() {
        let projects =
            parse_projects(&["api=/repos/api".to_string(), "docs=/repos/docs:ro".to_string()])
                .unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].access, ProjectAccess::Write);
        assert_eq!(projects[1].access, ProjectAccess::Read);
        assert_eq!(projects[1].path, "/repos/docs");
    }

    #[test]
    fn test_parse_projects_rejects_bad_spec() {
        assert!(parse_projects(&["no-equals".to_string()]).is_err());
    }

    #[test]
    fn test_parse_projects_json_descriptor() {
        let projects = parse_projects(&[
            r#"{"name":"api","paths":["/repo/api"],"config":{"context":"REST backend"}}"#
                .to_string(),
        ])
        .unwrap();
        assert_eq!(projects[0].name, "api");
        assert_eq!(projects[0].access, ProjectAccess::Write);
        assert_eq!(projects[0].context.as_deref(), Some("REST backend"));
    }
}
