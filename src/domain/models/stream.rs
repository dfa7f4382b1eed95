//! NDJSON stream records emitted by the assistant subprocess.
//!
//! The assistant writes one JSON record per line. Records carry a `type`
//! discriminator plus type-dependent fields; unknown fields and unknown types
//! are tolerated for forward compatibility.

use serde::{Deserialize, Serialize};

/// Classified record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecordKind {
    System,
    Assistant,
    User,
    ToolUse,
    ToolResult,
    Result,
    Unknown,
}

/// One parsed NDJSON line from the assistant stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "type", default)]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Fields we do not model; preserved so nothing is lost on re-serialization.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StreamRecord {
    pub fn kind(&self) -> StreamRecordKind {
        match self.record_type.as_str() {
            "system" => StreamRecordKind::System,
            "assistant" => StreamRecordKind::Assistant,
            "user" => StreamRecordKind::User,
            "tool_use" => StreamRecordKind::ToolUse,
            "tool_result" => StreamRecordKind::ToolResult,
            "result" => StreamRecordKind::Result,
            _ => StreamRecordKind::Unknown,
        }
    }

    /// The first record of a fresh invocation, carrying the session id.
    pub fn is_system_init(&self) -> bool {
        self.record_type == "system" && self.subtype.as_deref() == Some("init")
    }

    /// Turn cost; older assistants report it as `total_cost_usd`.
    pub fn cost_value(&self) -> Option<f64> {
        self.cost
            .or_else(|| self.extra.get("total_cost_usd").and_then(|v| v.as_f64()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            record_type: "assistant".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn system_init(session_id: impl Into<String>) -> Self {
        Self {
            record_type: "system".to_string(),
            subtype: Some("init".to_string()),
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn tool_use(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            record_type: "tool_use".to_string(),
            tool_name: Some(name.into()),
            tool_input: Some(input),
            ..Default::default()
        }
    }

    pub fn tool_result_record(result: impl Into<String>) -> Self {
        Self {
            record_type: "tool_result".to_string(),
            tool_result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn final_result(usage: UsageDelta, cost: f64, duration_ms: u64) -> Self {
        Self {
            record_type: "result".to_string(),
            usage: Some(usage),
            cost: Some(cost),
            duration_ms: Some(duration_ms),
            ..Default::default()
        }
    }
}

/// Token counters carried by a single record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

/// Usage summed across one assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
    pub duration_ms: u64,
}

impl UsageTotals {
    pub fn absorb(&mut self, delta: &UsageDelta) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.cache_creation_tokens += delta.cache_creation_tokens;
        self.cache_read_tokens += delta.cache_read_tokens;
    }
}
