pub mod gateway;
pub mod gemini;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
pub use murmur_schema::LlmError;
use serde::{Deserialize, Serialize};
use tokio_stream::iter as stream_iter;

pub use gateway::{GatewaySettings, ReflectionVerdict, RoleGateway, RoleSettings};
pub use gemini::GeminiProvider;

/// One block of model-visible content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    InlineImage {
        mime: String,
        data_b64: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Tool surface advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl LlmRequest {
    pub fn simple(model: String, system: Option<String>, user_text: String) -> Self {
        Self {
            model,
            system,
            messages: vec![LlmMessage::user(user_text)],
            max_tokens: 1024,
            temperature: None,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub content: Vec<ContentBlock>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    pub fn tool_uses(&self) -> Vec<(String, String, serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// One delta from a streaming call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub is_final: bool,
    pub stop_reason: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    async fn stream(&self, _request: LlmRequest) -> Result<ChunkStream, LlmError> {
        Err(LlmError::Provider(
            "streaming not supported by this provider".into(),
        ))
    }
}

/// Offline provider used by tests and the tester binary.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let user_text = request.messages.last().map(|m| m.text()).unwrap_or_default();
        let text = format!("[stub:{}] {user_text}", request.model);
        Ok(LlmResponse {
            text: text.clone(),
            content: vec![ContentBlock::Text { text }],
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("end_turn".into()),
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, LlmError> {
        let user_text = request.messages.last().map(|m| m.text()).unwrap_or_default();
        let full = format!("[stub:{}] {user_text}", request.model);
        let mut chunks: Vec<Result<StreamChunk, LlmError>> = full
            .split_inclusive(' ')
            .map(|word| {
                Ok(StreamChunk {
                    delta: word.to_string(),
                    is_final: false,
                    stop_reason: None,
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            stop_reason: Some("end_turn".into()),
        }));
        Ok(Box::pin(stream_iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn stub_chat_echoes_last_user_message() {
        let provider = StubProvider;
        let resp = provider
            .chat(LlmRequest::simple("m".into(), None, "ping".into()))
            .await
            .unwrap();
        assert!(resp.text.contains("ping"));
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn stub_stream_concatenates_to_chat_text() {
        let provider = StubProvider;
        let req = LlmRequest::simple("m".into(), None, "hello streaming world".into());
        let chat_text = provider.chat(req.clone()).await.unwrap().text;

        let mut stream = provider.stream(req).await.unwrap();
        let mut collected = String::new();
        let mut saw_final = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if chunk.is_final {
                saw_final = true;
            }
            collected.push_str(&chunk.delta);
        }
        assert!(saw_final);
        assert_eq!(collected, chat_text);
    }

    #[test]
    fn llm_message_text_skips_non_text_blocks() {
        let msg = LlmMessage {
            role: "assistant".into(),
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "web_search".into(),
                    input: serde_json::json!({}),
                },
            ],
        };
        assert_eq!(msg.text(), "a");
        assert_eq!(
            LlmResponse {
                text: "a".into(),
                content: msg.content.clone(),
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
            }
            .tool_uses()
            .len(),
            1
        );
    }
}
