pub mod cancel;
pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cancel::CancelToken;
pub use error::{CoreError, LlmError, ScheduleError, ToolErrorKind};

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One multimodal slice of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    InlineImage { mime: String, data_b64: String },
    ToolResultRef { task_id: String },
}

/// Message body: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text of all textual parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Content::Text(_) => 0,
            Content::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::InlineImage { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Originator-assigned id, used for de-duplication.
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Ordering timestamp; missing values are backfilled in receive order.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A collected conversation message. Immutable once collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
    #[serde(default)]
    pub metadata: MessageMeta,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
            metadata: MessageMeta::default(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            metadata: MessageMeta::default(),
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A structured decision by the planner to invoke one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
    pub priority: i32,
    pub task_id: String,
}

/// Output of the plan node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPlan {
    pub needs_tools: bool,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub reasoning: String,
}

impl AgentPlan {
    pub fn without_tools(reasoning: impl Into<String>) -> Self {
        Self {
            needs_tools: false,
            tool_calls: Vec::new(),
            reasoning: reasoning.into(),
        }
    }
}

/// A citation harvested from a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Side effect produced by the reminder tool. Scheduling happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderDetails {
    pub content: String,
    pub fire_at: DateTime<Utc>,
    pub channel_ref: String,
    pub user_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Result envelope for a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub task_id: String,
    pub tool_name: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect: Option<ReminderDetails>,
}

impl ToolExecutionResult {
    pub fn ok(task_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            tool_name: tool_name.into(),
            success: true,
            content: content.into(),
            error_kind: None,
            sources: Vec::new(),
            side_effect: None,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        tool_name: impl Into<String>,
        kind: ToolErrorKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tool_name: tool_name.into(),
            success: false,
            content: content.into(),
            error_kind: Some(kind),
            sources: Vec::new(),
            side_effect: None,
        }
    }
}

/// Stages emitted on the progress bus. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Starting,
    GenerateQuery,
    ToolStatus,
    Searching,
    Analyzing,
    Reflection,
    FinalizeAnswer,
    Streaming,
    Completed,
    Error,
    Timeout,
    ToolExecution,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Starting => "starting",
            ProgressStage::GenerateQuery => "generate_query",
            ProgressStage::ToolStatus => "tool_status",
            ProgressStage::Searching => "searching",
            ProgressStage::Analyzing => "analyzing",
            ProgressStage::Reflection => "reflection",
            ProgressStage::FinalizeAnswer => "finalize_answer",
            ProgressStage::Streaming => "streaming",
            ProgressStage::Completed => "completed",
            ProgressStage::Error => "error",
            ProgressStage::Timeout => "timeout",
            ProgressStage::ToolExecution => "tool_execution",
        }
    }

    /// High-frequency stages never get auto-generated blurbs.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, ProgressStage::ToolStatus | ProgressStage::Streaming)
    }

    /// Terminal notifications must survive queue pressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStage::Completed | ProgressStage::Error | ProgressStage::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u32>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl ProgressEvent {
    pub fn stage(stage: ProgressStage) -> Self {
        Self {
            stage,
            message: String::new(),
            progress_pct: None,
            eta_seconds: None,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_pct(mut self, pct: u8) -> Self {
        self.progress_pct = Some(pct.min(100));
        self
    }
}

/// A partial substring of the final answer delivered during finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub content: String,
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_text_joins_textual_parts() {
        let content = Content::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::InlineImage {
                mime: "image/png".into(),
                data_b64: "xxxx".into(),
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(content.text(), "ab");
        assert_eq!(content.image_count(), 1);
    }

    #[test]
    fn progress_stage_serializes_snake_case() {
        let json = serde_json::to_string(&ProgressStage::FinalizeAnswer).unwrap();
        assert_eq!(json, "\"finalize_answer\"");
        assert_eq!(ProgressStage::GenerateQuery.as_str(), "generate_query");
    }

    #[test]
    fn high_frequency_stages_skip_blurbs() {
        assert!(ProgressStage::ToolStatus.is_high_frequency());
        assert!(ProgressStage::Streaming.is_high_frequency());
        assert!(!ProgressStage::GenerateQuery.is_high_frequency());
    }

    #[test]
    fn progress_pct_is_clamped() {
        let event = ProgressEvent::stage(ProgressStage::Completed).with_pct(250);
        assert_eq!(event.progress_pct, Some(100));
    }

    #[test]
    fn reminder_details_roundtrip() {
        let details = ReminderDetails {
            content: "stretch".into(),
            fire_at: Utc::now(),
            channel_ref: "chan-1".into(),
            user_ref: "user-1".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&details).unwrap();
        let back: ReminderDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, details);
    }
}
