//! Event-to-interaction mapping and tool grouping.
//!
//! Maps the ordered NDJSON stream of one assistant turn onto conversation-log
//! entries: assistant text accumulates into one entry, contiguous
//! tool_use/tool_result runs collapse into a single tool group, echo and
//! bookkeeping records are dropped. The mapping is a pure state machine over
//! the event order; usage that only arrives with the final `result` record is
//! attached to the buffered assistant entry before it is emitted.

use uuid::Uuid;

use crate::domain::models::{Interaction, StreamRecord, StreamRecordKind, ToolCall, UsageDelta};

enum Pending {
    None,
    Assistant {
        content: String,
        usage: Option<UsageDelta>,
    },
    Tools(Vec<ToolCall>),
}

pub struct TranscriptMapper {
    task_id: Uuid,
    pending: Pending,
}

impl TranscriptMapper {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            pending: Pending::None,
        }
    }

    /// Feed one record; returns the interactions that became final.
    pub fn push(&mut self, record: &StreamRecord) -> Vec<Interaction> {
        match record.kind() {
            StreamRecordKind::System => {
                // Only carries the session id; not part of the transcript.
                Vec::new()
            }
            StreamRecordKind::User => {
                // Tool-result echo, already covered by the tool records.
                Vec::new()
            }
            StreamRecordKind::Assistant => {
                let mut out = self.flush_tools();
                let text = record.text.clone().unwrap_or_default();
                match &mut self.pending {
                    Pending::Assistant { content, usage } => {
                        content.push_str(&text);
                        if let Some(delta) = &record.usage {
                            let merged = usage.get_or_insert_with(UsageDelta::default);
                            merged.input_tokens += delta.input_tokens;
                            merged.output_tokens += delta.output_tokens;
                            merged.cache_creation_tokens += delta.cache_creation_tokens;
                            merged.cache_read_tokens += delta.cache_read_tokens;
                        }
                    }
                    _ => {
                        self.pending = Pending::Assistant {
                            content: text,
                            usage: record.usage,
                        };
                    }
                }
                out
            }
            StreamRecordKind::ToolUse => {
                let mut out = self.flush_assistant(None);
                let call = ToolCall {
                    name: record
                        .tool_name
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    input: record.tool_input.clone().unwrap_or(serde_json::Value::Null),
                    result: None,
                    is_error: false,
                };
                match &mut self.pending {
                    Pending::Tools(tools) => tools.push(call),
                    _ => self.pending = Pending::Tools(vec![call]),
                }
                out
            }
            StreamRecordKind::ToolResult => {
                let result_text = record.tool_result.clone().unwrap_or_default();
                let is_error = record.is_error.unwrap_or(false);
                match &mut self.pending {
                    Pending::Tools(tools) => {
                        if let Some(open) = tools.iter_mut().rev().find(|t| t.result.is_none()) {
                            open.result = Some(result_text);
                            open.is_error = is_error;
                            Vec::new()
                        } else {
                            // Every tool already resolved: close the group and
                            // log the orphan on its own.
                            let mut out = self.flush_tools();
                            out.push(Interaction::tool_result(self.task_id, result_text));
                            out
                        }
                    }
                    _ => {
                        let mut out = self.flush_assistant(None);
                        out.push(Interaction::tool_result(self.task_id, result_text));
                        out
                    }
                }
            }
            StreamRecordKind::Result => {
                // The tally record is folded into the turn outcome, not
                // persisted; it finalizes whatever is still buffered.
                let mut out = self.flush_tools();
                out.extend(self.flush_assistant(Some(record)));
                out
            }
            StreamRecordKind::Unknown => Vec::new(),
        }
    }

    /// Flush anything still buffered at end of turn.
    pub fn finish(&mut self) -> Vec<Interaction> {
        let mut out = self.flush_tools();
        out.extend(self.flush_assistant(None));
        out
    }

    fn flush_assistant(&mut self, result_record: Option<&StreamRecord>) -> Vec<Interaction> {
        if !matches!(self.pending, Pending::Assistant { .. }) {
            return Vec::new();
        }
        let Pending::Assistant { content, usage } =
            std::mem::replace(&mut self.pending, Pending::None)
        else {
            unreachable!()
        };

        // Prefer usage carried on the assistant records; fall back to the
        // turn tally from the result record.
        let usage = usage.or_else(|| result_record.and_then(|r| r.usage));
        let mut interaction = Interaction::assistant_response(self.task_id, content);
        if let Some(delta) = usage {
            interaction = interaction.with_usage(
                delta.input_tokens,
                delta.output_tokens,
                delta.cache_creation_tokens,
                delta.cache_read_tokens,
            );
        }
        if let Some(record) = result_record {
            if let (Some(cost), Some(duration_ms)) = (record.cost_value(), record.duration_ms) {
                interaction = interaction.with_cost(cost, duration_ms);
            }
        }
        vec![interaction]
    }

    fn flush_tools(&mut self) -> Vec<Interaction> {
        if !matches!(self.pending, Pending::Tools(_)) {
            return Vec::new();
        }
        let Pending::Tools(tools) = std::mem::replace(&mut self.pending, Pending::None) else {
            unreachable!()
        };
        if tools.is_empty() {
            Vec::new()
        } else {
            vec![Interaction::tool_group(self.task_id, tools)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::InteractionKind;

    fn mapper() -> TranscriptMapper {
        TranscriptMapper::new(Uuid::new_v4())
    }

    #[test]
    fn test_assistant_text_with_result_usage() {
        let mut m = mapper();
        assert!(m.push(&StreamRecord::system_init("sid")).is_empty());
        assert!(m.push(&StreamRecord::assistant("Done — greet.py written.")).is_empty());

        let result = StreamRecord::final_result(
            UsageDelta {
                output_tokens: 40,
                ..Default::default()
            },
            0.01,
            900,
        );
        let out = m.push(&result);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, InteractionKind::AssistantResponse);
        assert_eq!(out[0].content, "Done — greet.py written.");
        assert_eq!(out[0].output_tokens, Some(40));
        assert_eq!(out[0].duration_ms, Some(900));
        assert!(m.finish().is_empty());
    }

    #[test]
    fn test_contiguous_tools_become_one_group() {
        let mut m = mapper();
        assert!(m
            .push(&StreamRecord::tool_use("Read", serde_json::json!({"path": "a.rs"})))
            .is_empty());
        assert!(m.push(&StreamRecord::tool_result_record("contents")).is_empty());
        assert!(m
            .push(&StreamRecord::tool_use("Edit", serde_json::json!({"path": "a.rs"})))
            .is_empty());
        assert!(m.push(&StreamRecord::tool_result_record("ok")).is_empty());

        let out = m.push(&StreamRecord::assistant("All edits applied."));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, InteractionKind::ToolGroup);
        assert_eq!(out[0].tools.len(), 2);
        assert_eq!(out[0].tools[0].result.as_deref(), Some("contents"));
        assert_eq!(out[0].tools[1].name, "Edit");

        let tail = m.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, InteractionKind::AssistantResponse);
    }

    #[test]
    fn test_standalone_tool_result() {
        let mut m = mapper();
        let out = m.push(&StreamRecord::tool_result_record("orphan output"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, InteractionKind::ToolResult);
        assert_eq!(out[0].content, "orphan output");
    }

    #[test]
    fn test_separate_runs_become_separate_groups() {
        let mut m = mapper();
        m.push(&StreamRecord::tool_use("Read", serde_json::Value::Null));
        m.push(&StreamRecord::tool_result_record("a"));
        let first = m.push(&StreamRecord::assistant("thinking"));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, InteractionKind::ToolGroup);

        let flushed = m.push(&StreamRecord::tool_use("Bash", serde_json::Value::Null));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, InteractionKind::AssistantResponse);

        let second = m.finish();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, InteractionKind::ToolGroup);
        assert_eq!(second[0].tools[0].name, "Bash");
    }

    #[test]
    fn test_user_and_unknown_records_dropped() {
        let mut m = mapper();
        let user: StreamRecord =
            serde_json::from_str(r#"{"type":"user","text":"echo"}"#).unwrap();
        let unknown: StreamRecord =
            serde_json::from_str(r#"{"type":"telemetry"}"#).unwrap();
        assert!(m.push(&user).is_empty());
        assert!(m.push(&unknown).is_empty());
        assert!(m.finish().is_empty());
    }
}
