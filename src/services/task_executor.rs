//! Task executor: the per-task conversation loop.
//!
//! One loop runs per task, serialized within the task and parallel across
//! tasks. Each iteration chooses the next user turn by the priority contract
//! (queued human input first, then the auto-responder), streams one assistant
//! turn through persistence and fan-out, accounts tokens, consults completion
//! criteria, and enforces the resource envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Interaction, InteractionKind, Task, TaskStatus, UserInputEntry};
use crate::domain::ports::{AssistantClient, AssistantRequest, TaskStore, TestGate};
use crate::services::auto_responder::AutoResponder;
use crate::services::criteria_analyzer::CriteriaAnalyzer;
use crate::services::event_fanout::{EventFanOut, TaskEvent};
use crate::services::input_queue::UserInputQueue;
use crate::services::prompt;
use crate::services::transcript::TranscriptMapper;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long `request_stop` waits for the loop to acknowledge.
    pub stop_grace: Duration,
    /// How long `kill` waits before aborting the loop outright.
    pub kill_grace: Duration,
    /// Total window for retrying storage outages before failing the task.
    pub storage_retry_window: Duration,
    /// Pause between iterations when no input is waiting.
    pub inter_turn_delay: Duration,
    /// How often a chat-mode wait re-reads the task row.
    pub suspend_poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            kill_grace: Duration::from_secs(5),
            storage_retry_window: Duration::from_secs(30),
            inter_turn_delay: Duration::from_millis(500),
            suspend_poll_interval: Duration::from_secs(2),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    input_signal: Arc<Notify>,
    join: JoinHandle<()>,
}

enum Flow {
    /// Reached a terminal state.
    Done,
    /// Stop was requested; the row already says `Stopped`.
    Stopped,
}

enum NextTurn {
    Initial(String),
    Recovery(String),
    Human(UserInputEntry),
    Auto(String),
}

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    assistant: Arc<dyn AssistantClient>,
    queue: Arc<UserInputQueue>,
    responder: AutoResponder,
    fanout: Arc<EventFanOut>,
    criteria: Arc<CriteriaAnalyzer>,
    test_gate: Option<Arc<dyn TestGate>>,
    config: ExecutorConfig,
    running: Mutex<HashMap<Uuid, RunHandle>>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        assistant: Arc<dyn AssistantClient>,
        queue: Arc<UserInputQueue>,
        fanout: Arc<EventFanOut>,
        criteria: Arc<CriteriaAnalyzer>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            assistant,
            queue,
            responder: AutoResponder::new(),
            fanout,
            criteria,
            test_gate: None,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_test_gate(mut self, gate: Arc<dyn TestGate>) -> Self {
        self.test_gate = Some(gate);
        self
    }

    /// Spawn the loop for a task whose row is already `Running`.
    pub async fn spawn(self: &Arc<Self>, task_id: Uuid) {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.get(&task_id) {
            if !handle.join.is_finished() {
                debug!(task_id = %task_id, "loop already live");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let input_signal = Arc::new(Notify::new());
        let executor = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let loop_signal = input_signal.clone();

        let join = tokio::spawn(async move {
            executor.run_loop(task_id, loop_cancel, loop_signal).await;
        });

        running.insert(
            task_id,
            RunHandle {
                cancel,
                input_signal,
                join,
            },
        );
    }

    /// Best-effort nudge so a live loop dispatches queued input right away.
    pub async fn signal_input(&self, task_id: Uuid) {
        let running = self.running.lock().await;
        if let Some(handle) = running.get(&task_id) {
            handle.input_signal.notify_one();
        }
    }

    pub async fn is_running(&self, task_id: Uuid) -> bool {
        let running = self.running.lock().await;
        running
            .get(&task_id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }

    /// Cooperative stop: cancel the loop and wait for it to wind down. The
    /// assistant client bounds the subprocess drain at two seconds.
    pub async fn request_stop(&self, task_id: Uuid) {
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(&task_id)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if timeout(self.config.stop_grace, handle.join).await.is_err() {
                warn!(task_id = %task_id, "loop did not stop within grace window");
            }
        }
    }

    /// Unconditional teardown for delete: cancel, wait out the grace window,
    /// then abort.
    pub async fn kill(&self, task_id: Uuid) {
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(&task_id)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let mut join = handle.join;
            if timeout(self.config.kill_grace, &mut join).await.is_err() {
                warn!(task_id = %task_id, "loop ignored cancellation, aborting");
                join.abort();
            }
        }
    }

    #[instrument(skip(self, cancel, input_signal), fields(task_id = %task_id))]
    async fn run_loop(
        self: Arc<Self>,
        task_id: Uuid,
        cancel: CancellationToken,
        input_signal: Arc<Notify>,
    ) {
        info!("executor loop started");
        match self.drive(task_id, &cancel, &input_signal).await {
            Ok(Flow::Done) => info!("executor loop finished"),
            Ok(Flow::Stopped) => info!("executor loop stopped"),
            Err(e) => {
                error!(error = %e, "executor loop failed");
                let message = e.to_string();
                let _ = self
                    .transition(task_id, TaskStatus::Failed, Some(message))
                    .await;
            }
        }
        // The map entry is reaped by the next spawn/stop/kill; removing it
        // here would race a concurrent respawn.
    }

    async fn drive(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
        input_signal: &Notify,
    ) -> EngineResult<Flow> {
        let mut iteration = self
            .retry_storage(|| self.store.count_interactions(task_id, InteractionKind::AssistantResponse))
            .await?;
        let mut last_assistant_text = self.latest_assistant_text(task_id).await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(Flow::Stopped);
            }

            let task = self.fetch(task_id).await?;
            if task.status == TaskStatus::Stopped {
                return Ok(Flow::Stopped);
            }

            // Resource envelope. Checked before the call so a zero cap
            // exhausts the task without ever invoking the assistant.
            if iteration >= task.criteria_config.max_iterations as u64 {
                let message = format!(
                    "iteration cap reached ({} of {})",
                    iteration, task.criteria_config.max_iterations
                );
                self.transition(task_id, TaskStatus::Exhausted, Some(message)).await?;
                return Ok(Flow::Done);
            }
            if let Some(max_tokens) = task.criteria_config.max_tokens {
                if task.total_tokens_used >= max_tokens {
                    let message = format!(
                        "token cap reached ({} of {max_tokens})",
                        task.total_tokens_used
                    );
                    self.transition(task_id, TaskStatus::Exhausted, Some(message)).await?;
                    return Ok(Flow::Done);
                }
            }

            let next_turn = match self
                .choose_turn(&task, iteration, &last_assistant_text, cancel, input_signal)
                .await?
            {
                Some(turn) => turn,
                // Suspension ended by stop.
                None => return Ok(Flow::Stopped),
            };

            // Persist the chosen user turn and publish it.
            let (prompt_text, attachments) = match &next_turn {
                NextTurn::Initial(text) => {
                    let interaction = Interaction::user_request(task_id, text.clone());
                    self.persist_and_publish(interaction).await?;
                    (text.clone(), Vec::new())
                }
                NextTurn::Recovery(text) => {
                    // The recovery context was already persisted by recover.
                    (text.clone(), Vec::new())
                }
                NextTurn::Human(entry) => {
                    let interaction = Interaction::user_request(task_id, entry.text.clone())
                        .with_attachments(entry.images.clone());
                    self.persist_and_publish(interaction).await?;
                    (entry.text.clone(), entry.images.clone())
                }
                NextTurn::Auto(text) => {
                    let interaction = Interaction::simulated_human(task_id, text.clone());
                    self.persist_and_publish(interaction).await?;
                    (text.clone(), Vec::new())
                }
            };

            // One assistant exchange; retried once without the session id if
            // the assistant no longer recognizes it.
            let task = self.fetch(task_id).await?;
            let outcome = match self
                .assistant_exchange(&task, &prompt_text, &attachments, cancel, false)
                .await
            {
                Ok(outcome) => outcome,
                Err(EngineError::AssistantFailed { stderr, .. })
                    if task.assistant_session_id.is_some()
                        && stderr.contains("No conversation found with session ID") =>
                {
                    warn!(task_id = %task_id, "stale assistant session, retrying fresh");
                    self.store
                        .mutate(task_id, &|t: &mut Task| {
                            t.assistant_session_id = None;
                            Ok(())
                        })
                        .await?;
                    let task = self.fetch(task_id).await?;
                    self.assistant_exchange(&task, &prompt_text, &attachments, cancel, true)
                        .await?
                }
                Err(e) => return Err(e),
            };

            iteration += 1;
            if !outcome.full_text.is_empty() {
                last_assistant_text = outcome.full_text.clone();
            }

            if cancel.is_cancelled() {
                // Stop landed mid-turn; everything read so far is persisted.
                return Ok(Flow::Stopped);
            }

            // Completion: criteria judge when configured, heuristic fallback.
            let task = self.fetch(task_id).await?;
            let mut completed = false;
            if let Some(criteria) = task.criteria_config.criteria.clone() {
                let tail = self.transcript_tail(task_id).await?;
                let verdict = self
                    .criteria
                    .judge(&criteria, &tail, &last_assistant_text)
                    .await;
                debug!(
                    task_id = %task_id,
                    is_complete = verdict.is_complete,
                    confidence = verdict.confidence,
                    "criteria verdict"
                );
                completed = verdict.meets_threshold();
            }
            if !completed {
                completed = self.responder.looks_complete(&last_assistant_text);
            }

            if completed {
                self.finish_success(task_id, &last_assistant_text).await?;
                return Ok(Flow::Done);
            }

            // Brief breather; an immediate-input signal cuts it short.
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Stopped),
                _ = input_signal.notified() => {}
                _ = sleep(self.config.inter_turn_delay) => {}
            }
        }
    }

    /// Choose the next user turn by the priority contract. Returns `None`
    /// when a chat-mode suspension was ended by stop.
    async fn choose_turn(
        &self,
        task: &Task,
        iteration: u64,
        last_assistant_text: &str,
        cancel: &CancellationToken,
        input_signal: &Notify,
    ) -> EngineResult<Option<NextTurn>> {
        // First turn of the task's lifetime: the initial prompt.
        if task.assistant_session_id.is_none() {
            let prior = self
                .retry_storage(|| self.store.count_interactions(task.id, InteractionKind::AssistantResponse))
                .await?;
            if prior == 0 {
                return Ok(Some(NextTurn::Initial(prompt::initial_prompt(task))));
            }
            // Session was cleared by recover: drive the fresh session with
            // the recovery context.
            let interactions = self
                .retry_storage(|| self.store.list_interactions(task.id))
                .await?;
            let text = interactions
                .iter()
                .rev()
                .find(|i| i.kind == InteractionKind::SystemMessage)
                .map(|i| i.content.clone())
                .unwrap_or_else(|| prompt::recovery_message(&interactions));
            return Ok(Some(NextTurn::Recovery(text)));
        }

        // Transient pause while the next turn is decided.
        self.transition(task.id, TaskStatus::Paused, None).await.ok();

        let turn = loop {
            if let Some(entry) = self.queue.pop_unprocessed(task.id).await? {
                // Consuming the entry also releases the immediate-dispatch
                // guard set by trigger_immediate.
                self.store
                    .mutate(task.id, &|t: &mut Task| {
                        t.immediate_processing_active = false;
                        Ok(())
                    })
                    .await?;
                break NextTurn::Human(entry);
            }

            if !task.chat_mode {
                break NextTurn::Auto(self.responder.generate(
                    last_assistant_text,
                    &task.description,
                    iteration,
                ));
            }

            // Chat mode: suspend until input arrives or stop lands.
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = input_signal.notified() => {}
                _ = sleep(self.config.suspend_poll_interval) => {
                    let current = self.fetch(task.id).await?;
                    if current.status == TaskStatus::Stopped {
                        return Ok(None);
                    }
                }
            }
        };

        self.transition(task.id, TaskStatus::Running, None).await.ok();
        Ok(Some(turn))
    }

    /// Run one assistant turn: spawn, stream events into the transcript, and
    /// settle accounting.
    async fn assistant_exchange(
        &self,
        task: &Task,
        prompt_text: &str,
        attachments: &[crate::domain::models::ImageAttachment],
        cancel: &CancellationToken,
        force_fresh: bool,
    ) -> EngineResult<crate::domain::ports::AssistantOutcome> {
        let mut request = AssistantRequest::new(prompt_text.to_string())
            .with_attachments(attachments.to_vec());
        if !force_fresh {
            if let Some(session_id) = &task.assistant_session_id {
                request = request.resuming(session_id.clone());
            }
        }
        if let Some(dir) = task.worktree_path.as_ref().or(task.root_path.as_ref()) {
            request = request.in_dir(dir.clone());
        }

        let turn_cancel = cancel.child_token();
        let mut turn = self.assistant.begin(request, turn_cancel).await?;

        if let Some(pid) = turn.subprocess_id {
            self.store
                .mutate(task.id, &move |t: &mut Task| {
                    t.subprocess_id = Some(pid);
                    Ok(())
                })
                .await
                .ok();
        }

        let mut mapper = TranscriptMapper::new(task.id);
        while let Some(record) = turn.events.recv().await {
            for interaction in mapper.push(&record) {
                self.persist_and_publish(interaction).await?;
            }
        }
        for interaction in mapper.finish() {
            self.persist_and_publish(interaction).await?;
        }

        let outcome = turn.finish().await?;

        // Session id is captured exactly once, before any further turns.
        if task.assistant_session_id.is_none() || force_fresh {
            if let Some(session_id) = outcome.session_id.clone() {
                self.store
                    .mutate(task.id, &move |t: &mut Task| {
                        if t.assistant_session_id.is_none() || force_fresh {
                            t.assistant_session_id = Some(session_id.clone());
                        }
                        Ok(())
                    })
                    .await?;
            }
        }

        // Counter bump strictly follows persistence of the turn's log.
        if outcome.usage.output_tokens > 0 {
            self.retry_storage(|| self.store.increment_tokens(task.id, outcome.usage.output_tokens))
                .await?;
        }

        self.store
            .mutate(task.id, &|t: &mut Task| {
                t.subprocess_id = None;
                Ok(())
            })
            .await
            .ok();

        Ok(outcome)
    }

    async fn finish_success(&self, task_id: Uuid, final_text: &str) -> EngineResult<()> {
        let summary = prompt::extract_summary(final_text);

        if let Some(gate) = &self.test_gate {
            self.transition(task_id, TaskStatus::Testing, None).await?;
            let task = self.fetch(task_id).await?;
            match gate.verify(&task).await {
                Ok(verdict) if verdict.passed => {
                    self.store
                        .mutate(task_id, &move |t: &mut Task| {
                            t.summary = Some(summary.clone());
                            Ok(())
                        })
                        .await?;
                    self.transition(task_id, TaskStatus::Completed, None).await?;
                }
                Ok(verdict) => {
                    self.transition(
                        task_id,
                        TaskStatus::Failed,
                        Some(format!("verification failed: {}", verdict.output)),
                    )
                    .await?;
                }
                Err(e) => {
                    self.transition(
                        task_id,
                        TaskStatus::Failed,
                        Some(format!("verification error: {e}")),
                    )
                    .await?;
                }
            }
            return Ok(());
        }

        self.store
            .mutate(task_id, &move |t: &mut Task| {
                if t.summary.is_none() {
                    t.summary = Some(summary.clone());
                }
                Ok(())
            })
            .await?;
        self.transition(task_id, TaskStatus::Finished, None).await?;
        Ok(())
    }

    /// Transition the row and publish the status change.
    async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        error_message: Option<String>,
    ) -> EngineResult<()> {
        let from_slot = Arc::new(std::sync::Mutex::new(None));
        let slot = from_slot.clone();
        self.store
            .mutate(task_id, &move |t: &mut Task| {
                *slot.lock().unwrap() = Some(t.status);
                if t.status == to {
                    return Ok(());
                }
                t.transition_to(to).map_err(EngineError::Validation)?;
                if let Some(message) = &error_message {
                    t.error_message = Some(message.clone());
                }
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

    async fn persist_and_publish(&self, interaction: Interaction) -> EngineResult<()> {
        self.retry_storage(|| self.store.append_interaction(&interaction))
            .await?;
        self.fanout
            .publish(interaction.task_id, TaskEvent::Interaction(interaction.clone()))
            .await;
        Ok(())
    }

    async fn fetch(&self, task_id: Uuid) -> EngineResult<Task> {
        self.retry_storage(|| self.store.get_task(task_id))
            .await?
            .ok_or_else(|| EngineError::task_not_found(task_id))
    }

    async fn latest_assistant_text(&self, task_id: Uuid) -> EngineResult<String> {
        let interactions = self
            .retry_storage(|| self.store.list_interactions(task_id))
            .await?;
        Ok(interactions
            .iter()
            .rev()
            .find(|i| i.kind == InteractionKind::AssistantResponse)
            .map(|i| i.content.clone())
            .unwrap_or_default())
    }

    /// Last three interactions, formatted for the criteria judge.
    async fn transcript_tail(&self, task_id: Uuid) -> EngineResult<String> {
        let interactions = self
            .retry_storage(|| self.store.list_interactions(task_id))
            .await?;
        Ok(interactions
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|i| format!("[{}] {}", i.kind.as_str(), i.content))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    /// Retry storage outages with backoff for up to the configured window;
    /// anything else propagates immediately.
    async fn retry_storage<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let deadline = Instant::now() + self.config.storage_retry_window;
        let mut delay = Duration::from_millis(250);
        loop {
            match op().await {
                Err(EngineError::StorageUnavailable(reason)) if Instant::now() < deadline => {
                    warn!(%reason, "storage unavailable, backing off");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                other => return other,
            }
        }
    }
}
