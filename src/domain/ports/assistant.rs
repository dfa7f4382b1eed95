//! Assistant client port.
//!
//! The assistant is an external program that reads a prompt from its argument
//! list, writes NDJSON records to stdout, and exits. Implementations own the
//! subprocess; callers own the parse/persist pipeline by draining the event
//! channel.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ImageAttachment, StreamRecord, UsageTotals};

/// One prompt to send to the assistant.
#[derive(Debug, Clone, Default)]
pub struct AssistantRequest {
    pub prompt: String,
    /// Resume id; when set the invocation continues an existing session.
    pub resume_session_id: Option<String>,
    /// Working directory for the subprocess. The isolated checkout when the
    /// task holds one.
    pub workdir: Option<PathBuf>,
    pub attachments: Vec<ImageAttachment>,
}

impl AssistantRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<ImageAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Final accounting for one assistant turn.
#[derive(Debug, Clone, Default)]
pub struct AssistantOutcome {
    /// Concatenated assistant text; the final `result` record is authoritative
    /// when present.
    pub full_text: String,
    /// Session id extracted from the `system.init` record of a fresh
    /// invocation; `None` on resumed calls.
    pub session_id: Option<String>,
    pub subprocess_id: Option<u32>,
    pub usage: UsageTotals,
}

/// An in-flight assistant turn: a live event channel plus the deferred
/// outcome, resolved when the subprocess exits.
pub struct AssistantTurn {
    pub events: mpsc::Receiver<StreamRecord>,
    pub outcome: oneshot::Receiver<EngineResult<AssistantOutcome>>,
    pub subprocess_id: Option<u32>,
}

impl AssistantTurn {
    /// Wait for the turn to finish after the event channel has been drained.
    pub async fn finish(self) -> EngineResult<AssistantOutcome> {
        self.outcome
            .await
            .map_err(|_| EngineError::SubprocessSpawnFailed("assistant turn dropped".into()))?
    }
}

#[async_trait]
pub trait AssistantClient: Send + Sync {
    /// Start a turn. Events stream on the returned channel in stdout order;
    /// cancelling the token interrupts the subprocess, drains briefly, then
    /// force-terminates.
    async fn begin(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
    ) -> EngineResult<AssistantTurn>;

    /// Run a turn to completion, collecting all events. Convenience for
    /// one-shot meta-invocations that do not stream.
    async fn send(
        &self,
        request: AssistantRequest,
    ) -> EngineResult<(AssistantOutcome, Vec<StreamRecord>)> {
        let mut turn = self.begin(request, CancellationToken::new()).await?;
        let mut events = Vec::new();
        while let Some(record) = turn.events.recv().await {
            events.push(record);
        }
        let outcome = turn.finish().await?;
        Ok((outcome, events))
    }
}
