//! Assistant client implementations: the real subprocess client and a
//! scripted double for tests.

pub mod cli;
pub mod scripted;

pub use cli::{CliAssistantClient, CliAssistantConfig};
pub use scripted::ScriptedAssistant;

use crate::domain::models::{StreamRecord, UsageTotals};
use crate::domain::ports::AssistantOutcome;

/// Fold an ordered record stream into the turn outcome.
///
/// Assistant text chunks accumulate; the final `result` record, when present,
/// replaces them (it carries the assembled text) and contributes the
/// authoritative usage tally. The session id is taken from the first
/// `system.init` record of a fresh invocation only.
pub(crate) fn fold_outcome<'a>(
    records: impl IntoIterator<Item = &'a StreamRecord>,
    resumed: bool,
) -> AssistantOutcome {
    let mut text_chunks: Vec<String> = Vec::new();
    let mut usage = UsageTotals::default();
    let mut session_id: Option<String> = None;

    for record in records {
        if record.is_system_init() && !resumed && session_id.is_none() {
            session_id = record.session_id.clone();
        }
        match record.record_type.as_str() {
            "assistant" => {
                if let Some(text) = &record.text {
                    text_chunks.push(text.clone());
                }
                if let Some(delta) = &record.usage {
                    usage.absorb(delta);
                }
            }
            "result" => {
                if let Some(result_text) = &record.result {
                    if !result_text.is_empty() {
                        text_chunks = vec![result_text.clone()];
                    }
                }
                if let Some(delta) = &record.usage {
                    usage.absorb(delta);
                }
                if let Some(cost) = record.cost_value() {
                    usage.cost += cost;
                }
                if let Some(duration_ms) = record.duration_ms {
                    usage.duration_ms += duration_ms;
                }
            }
            _ => {}
        }
    }

    AssistantOutcome {
        full_text: text_chunks.join("").trim().to_string(),
        session_id,
        subprocess_id: None,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::UsageDelta;

    #[test]
    fn test_fold_result_record_is_authoritative() {
        let records = vec![
            StreamRecord::system_init("sid-9"),
            StreamRecord::assistant("partial "),
            StreamRecord::assistant("chunks"),
            StreamRecord::final_result(
                UsageDelta {
                    output_tokens: 40,
                    ..Default::default()
                },
                0.02,
                1200,
            ),
        ];
        let mut with_result = records.clone();
        with_result[3].result = Some("Final assembled answer.".to_string());

        let outcome = fold_outcome(&with_result, false);
        assert_eq!(outcome.full_text, "Final assembled answer.");
        assert_eq!(outcome.session_id.as_deref(), Some("sid-9"));
        assert_eq!(outcome.usage.output_tokens, 40);
        assert!((outcome.usage.cost - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fold_without_result_concatenates_chunks() {
        let records = vec![
            StreamRecord::assistant("Hello "),
            StreamRecord::assistant("world"),
        ];
        let outcome = fold_outcome(&records, true);
        assert_eq!(outcome.full_text, "Hello world");
        assert!(outcome.session_id.is_none());
    }

    #[test]
    fn test_fold_ignores_init_session_on_resumed_call() {
        let records = vec![StreamRecord::system_init("fresh-sid")];
        let outcome = fold_outcome(&records, true);
        assert!(outcome.session_id.is_none());
    }
}
