//! Scripted assistant for tests: replays queued event turns and records every
//! request it receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::StreamRecord;
use crate::domain::ports::{AssistantClient, AssistantRequest, AssistantTurn};

use super::fold_outcome;

/// A request as seen by the scripted assistant.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub prompt: String,
    pub resume_session_id: Option<String>,
    pub workdir: Option<String>,
}

enum ScriptedTurn {
    Events(Vec<StreamRecord>),
    Failure(String),
}

/// Test double implementing [`AssistantClient`].
///
/// Turns are replayed in FIFO order; when the script runs dry a minimal
/// "Done." turn is produced so loops terminate.
#[derive(Clone, Default)]
pub struct ScriptedAssistant {
    turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one turn of stream records.
    pub fn push_turn(&self, records: Vec<StreamRecord>) {
        self.turns
            .lock()
            .unwrap()
            .push_back(ScriptedTurn::Events(records));
    }

    /// Queue a spawn failure.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.turns
            .lock()
            .unwrap()
            .push_back(ScriptedTurn::Failure(message.into()));
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl AssistantClient for ScriptedAssistant {
    async fn begin(
        &self,
        request: AssistantRequest,
        _cancel: CancellationToken,
    ) -> EngineResult<AssistantTurn> {
        self.requests.lock().unwrap().push(RecordedRequest {
            prompt: request.prompt.clone(),
            resume_session_id: request.resume_session_id.clone(),
            workdir: request
                .workdir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        });

        let turn = self.turns.lock().unwrap().pop_front();
        let records = match turn {
            Some(ScriptedTurn::Events(records)) => records,
            Some(ScriptedTurn::Failure(message)) => {
                return Err(EngineError::SubprocessSpawnFailed(message));
            }
            None => vec![StreamRecord::assistant("Done.")],
        };

        let resumed = request.resume_session_id.is_some();
        let (tx, rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(async move {
            for record in &records {
                if tx.send(record.clone()).await.is_err() {
                    break;
                }
            }
            drop(tx);
            let _ = outcome_tx.send(Ok(fold_outcome(records.iter(), resumed)));
        });

        Ok(AssistantTurn {
            events: rx,
            outcome: outcome_rx,
            subprocess_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::UsageDelta;
    use crate::domain::ports::AssistantClient as _;

    #[tokio::test]
    async fn test_scripted_turn_replay_and_recording() {
        let assistant = ScriptedAssistant::new();
        assistant.push_turn(vec![
            StreamRecord::system_init("sid-1"),
            StreamRecord::assistant("working on it"),
            StreamRecord::final_result(
                UsageDelta {
                    output_tokens: 12,
                    ..Default::default()
                },
                0.0,
                100,
            ),
        ]);

        let (outcome, events) = assistant
            .send(AssistantRequest::new("first prompt"))
            .await
            .unwrap();

        assert_eq!(outcome.session_id.as_deref(), Some("sid-1"));
        assert_eq!(outcome.usage.output_tokens, 12);
        assert_eq!(events.len(), 3);

        let requests = assistant.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "first prompt");
        assert!(requests[0].resume_session_id.is_none());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let assistant = ScriptedAssistant::new();
        assistant.push_failure("binary missing");
        let err = assistant
            .send(AssistantRequest::new("prompt"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SubprocessSpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_dry_script_yields_default_done_turn() {
        let assistant = ScriptedAssistant::new();
        let (outcome, _) = assistant
            .send(AssistantRequest::new("anything"))
            .await
            .unwrap();
        assert_eq!(outcome.full_text, "Done.");
    }
}
