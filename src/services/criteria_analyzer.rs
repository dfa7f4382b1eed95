//! Criteria analyzer: meta-invocations of the assistant that turn free-text
//! task descriptions into success criteria and judge completion against them.
//!
//! Both operations run the assistant with a fresh session (a user task's
//! session is never resumed here) and are best-effort: any failure degrades
//! to "no criteria" / "not complete".

use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::ports::{AssistantClient, AssistantRequest};

/// Completion requires the judge to be confident.
pub const COMPLETION_CONFIDENCE_FLOOR: f64 = 0.7;

#[derive(Debug, Clone, Default)]
pub struct CriteriaExtraction {
    pub criteria: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionVerdict {
    pub is_complete: bool,
    pub confidence: f64,
    pub reasoning: String,
}

impl CompletionVerdict {
    /// Only a confident positive verdict counts as completion.
    pub fn meets_threshold(&self) -> bool {
        self.is_complete && self.confidence >= COMPLETION_CONFIDENCE_FLOOR
    }

    fn not_complete(reasoning: impl Into<String>) -> Self {
        Self {
            is_complete: false,
            confidence: 0.0,
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    criteria: String,
    #[serde(default)]
    is_clear: bool,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct JudgeReply {
    #[serde(default)]
    is_complete: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

pub struct CriteriaAnalyzer {
    assistant: Arc<dyn AssistantClient>,
    json_block: Regex,
}

impl CriteriaAnalyzer {
    pub fn new(assistant: Arc<dyn AssistantClient>) -> Self {
        Self {
            assistant,
            json_block: Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("static pattern"),
        }
    }

    /// Restate the success condition of a task description, or report that it
    /// has none.
    pub async fn extract(&self, description: &str) -> CriteriaExtraction {
        let prompt = format!(
            "Analyze the following task description and extract the ending criteria - \
             what would indicate this task is complete and successful.\n\n\
             Task Description:\n{description}\n\n\
             Please provide:\n\
             1. A clear, specific description of what indicates task completion (2-3 sentences max)\n\
             2. Whether the ending criteria is clear and measurable (yes/no)\n\n\
             Respond in JSON format:\n\
             {{\n    \"criteria\": \"description of success criteria\",\n    \
             \"is_clear\": true/false,\n    \"reasoning\": \"brief explanation\"\n}}"
        );

        let reply = match self.assistant.send(AssistantRequest::new(prompt)).await {
            Ok((outcome, _)) => outcome.full_text,
            Err(e) => {
                warn!(error = %e, "criteria extraction failed");
                return CriteriaExtraction {
                    criteria: None,
                    warning: Some(format!("criteria extraction unavailable: {e}")),
                };
            }
        };

        match self
            .extract_json(&reply)
            .and_then(|json| serde_json::from_str::<ExtractionReply>(&json).ok())
        {
            Some(parsed) if parsed.is_clear && !parsed.criteria.trim().is_empty() => {
                debug!(criteria = %parsed.criteria, "criteria extracted");
                CriteriaExtraction {
                    criteria: Some(parsed.criteria.trim().to_string()),
                    warning: None,
                }
            }
            Some(parsed) => CriteriaExtraction {
                criteria: None,
                warning: Some(if parsed.reasoning.is_empty() {
                    "no measurable completion condition found in the description".to_string()
                } else {
                    parsed.reasoning
                }),
            },
            None => CriteriaExtraction {
                criteria: None,
                warning: Some("criteria extraction returned no usable verdict".to_string()),
            },
        }
    }

    /// Judge whether the task met its criteria given the transcript tail and
    /// the latest assistant text.
    pub async fn judge(
        &self,
        criteria: &str,
        transcript_tail: &str,
        latest_assistant_text: &str,
    ) -> CompletionVerdict {
        let prompt = format!(
            "Based on the conversation history, determine if the following task has met \
             its ending criteria.\n\n\
             Ending Criteria (Success Condition):\n{criteria}\n\n\
             Recent Conversation:\n{transcript_tail}\n\n\
             Latest Response:\n{latest_assistant_text}\n\n\
             Has the task met its ending criteria? Respond in JSON format:\n\
             {{\n    \"is_complete\": true/false,\n    \
             \"reasoning\": \"brief explanation of why the criteria is/isn't met\",\n    \
             \"confidence\": 0.0-1.0\n}}\n\n\
             Be strict - only mark as complete if the ending criteria is clearly and fully met."
        );

        let reply = match self.assistant.send(AssistantRequest::new(prompt)).await {
            Ok((outcome, _)) => outcome.full_text,
            Err(e) => {
                warn!(error = %e, "completion judgment failed");
                return CompletionVerdict::not_complete(format!("judge unavailable: {e}"));
            }
        };

        match self
            .extract_json(&reply)
            .and_then(|json| serde_json::from_str::<JudgeReply>(&json).ok())
        {
            Some(parsed) => CompletionVerdict {
                is_complete: parsed.is_complete,
                confidence: parsed.confidence,
                reasoning: if parsed.reasoning.is_empty() {
                    "no reasoning given".to_string()
                } else {
                    parsed.reasoning
                },
            },
            None => CompletionVerdict::not_complete("could not parse completion check"),
        }
    }

    /// Pull a JSON object out of free text: fenced code blocks first, then a
    /// balanced-brace scan.
    fn extract_json(&self, text: &str) -> Option<String> {
        if let Some(captures) = self.json_block.captures(text) {
            return Some(captures[1].to_string());
        }

        let start = text.find('{')?;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, c) in text[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start..start + offset + 1].to_string());
                    }
                }
                _ => {}
            }
        }
        None
    }
}
