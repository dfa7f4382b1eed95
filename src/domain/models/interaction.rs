//! Interaction domain model: one persisted turn in a task's conversation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a logged interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Human-originated user turn (or the initial prompt)
    UserRequest,
    /// Assistant text turn
    AssistantResponse,
    /// Auto-responder-generated user turn
    SimulatedHuman,
    /// A tool result that arrived without a matching tool_use
    ToolResult,
    /// A contiguous run of tool_use/tool_result pairs within one turn
    ToolGroup,
    /// Engine-originated context (e.g. recovery summaries)
    SystemMessage,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequest => "user_request",
            Self::AssistantResponse => "assistant_response",
            Self::SimulatedHuman => "simulated_human",
            Self::ToolResult => "tool_result",
            Self::ToolGroup => "tool_group",
            Self::SystemMessage => "system_message",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user_request" => Some(Self::UserRequest),
            "assistant_response" => Some(Self::AssistantResponse),
            "simulated_human" => Some(Self::SimulatedHuman),
            "tool_result" => Some(Self::ToolResult),
            "tool_group" => Some(Self::ToolGroup),
            "system_message" => Some(Self::SystemMessage),
            _ => None,
        }
    }
}

/// A base64-encoded image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub base64: String,
    pub media_type: String,
}

/// One tool invocation inside a `ToolGroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// One persisted turn in the conversation log. Never mutated after creation;
/// deleted only with its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: InteractionKind,
    pub content: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ImageAttachment>,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    fn base(task_id: Uuid, kind: InteractionKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind,
            content: content.into(),
            input_tokens: None,
            output_tokens: None,
            cache_creation_tokens: None,
            cache_read_tokens: None,
            cost: None,
            duration_ms: None,
            tools: Vec::new(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user_request(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(task_id, InteractionKind::UserRequest, content)
    }

    pub fn assistant_response(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(task_id, InteractionKind::AssistantResponse, content)
    }

    pub fn simulated_human(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(task_id, InteractionKind::SimulatedHuman, content)
    }

    pub fn tool_result(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(task_id, InteractionKind::ToolResult, content)
    }

    pub fn tool_group(task_id: Uuid, tools: Vec<ToolCall>) -> Self {
        let content = tools
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut interaction = Self::base(task_id, InteractionKind::ToolGroup, content);
        interaction.tools = tools;
        interaction
    }

    pub fn system_message(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(task_id, InteractionKind::SystemMessage, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<ImageAttachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_usage(
        mut self,
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_tokens: u64,
        cache_read_tokens: u64,
    ) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self.cache_creation_tokens = Some(cache_creation_tokens);
        self.cache_read_tokens = Some(cache_read_tokens);
        self
    }

    pub fn with_cost(mut self, cost: f64, duration_ms: u64) -> Self {
        self.cost = Some(cost);
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_group_content_lists_tool_names() {
        let task_id = Uuid::new_v4();
        let group = Interaction::tool_group(
            task_id,
            vec![
                ToolCall {
                    name: "Read".to_string(),
                    input: serde_json::json!({"path": "src/lib.rs"}),
                    result: Some("...".to_string()),
                    is_error: false,
                },
                ToolCall {
                    name: "Edit".to_string(),
                    input: serde_json::Value::Null,
                    result: None,
                    is_error: false,
                },
            ],
        );
        assert_eq!(group.kind, InteractionKind::ToolGroup);
        assert_eq!(group.content, "Read, Edit");
        assert_eq!(group.tools.len(), 2);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            InteractionKind::UserRequest,
            InteractionKind::AssistantResponse,
            InteractionKind::SimulatedHuman,
            InteractionKind::ToolResult,
            InteractionKind::ToolGroup,
            InteractionKind::SystemMessage,
        ] {
            assert_eq!(InteractionKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
