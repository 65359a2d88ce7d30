//! Google Gemini REST provider.
//!
//! https://ai.google.dev/api/generate-content

use async_trait::async_trait;
use murmur_schema::LlmError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::{ChunkStream, ContentBlock, LlmProvider, LlmRequest, LlmResponse, StreamChunk};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base(api_key, API_BASE)
    }

    pub fn with_base(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into(),
        }
    }

    fn encode_request(&self, request: &LlmRequest) -> GenerateRequest {
        let mut contents = Vec::new();

        for message in &request.messages {
            let role = match message.role.as_str() {
                "assistant" => "model",
                _ => "user",
            };

            let mut parts = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => {
                        parts.push(WirePart::Text { text: text.clone() });
                    }
                    ContentBlock::InlineImage { mime, data_b64 } => {
                        parts.push(WirePart::InlineData {
                            inline_data: WireBlob {
                                mime_type: mime.clone(),
                                data: data_b64.clone(),
                            },
                        });
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        parts.push(WirePart::FunctionCall {
                            function_call: WireFunctionCall {
                                name: name.clone(),
                                args: input.clone(),
                            },
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        parts.push(WirePart::FunctionResponse {
                            function_response: WireFunctionResponse {
                                name: tool_use_id.clone(),
                                response: serde_json::json!({ "result": content }),
                            },
                        });
                    }
                }
            }

            if !parts.is_empty() {
                contents.push(WireContent {
                    role: role.to_string(),
                    parts,
                });
            }
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![WireTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|tool| WireFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    })
                    .collect(),
            }])
        };

        GenerateRequest {
            contents,
            system_instruction: request.system.as_ref().map(|text| WireContent {
                role: "user".to_string(),
                parts: vec![WirePart::Text { text: text.clone() }],
            }),
            generation_config: Some(WireGenerationConfig {
                max_output_tokens: Some(request.max_tokens),
                temperature: request.temperature,
            }),
            tools,
        }
    }

    async fn post(&self, url: &str, payload: &GenerateRequest) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::TransientNetwork("request timed out".into())
                } else if e.is_connect() {
                    LlmError::TransientNetwork(format!("connect failure: {e}"))
                } else {
                    LlmError::Provider(e.to_string())
                }
            })?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }
        Ok(resp)
    }
}

pub(crate) fn classify_api_error(status: StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        429 => LlmError::RateLimited(format!("http 429: {body}")),
        400 if body.contains("token") && (body.contains("exceed") || body.contains("too long")) => {
            LlmError::ContextOverflow(format!("http 400: {body}"))
        }
        500..=599 => LlmError::TransientNetwork(format!("http {status}: {body}")),
        _ => LlmError::Provider(format!("http {status}: {body}")),
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, request.model, self.api_key
        );
        let payload = self.encode_request(&request);

        let resp = self.post(&url, &payload).await?;
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Provider(format!("malformed response body: {e}")))?;
        decode_response(body)
    }

    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, LlmError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?key={}&alt=sse",
            self.api_base, request.model, self.api_key
        );
        let payload = self.encode_request(&request);

        let resp = self.post(&url, &payload).await?;
        Ok(Box::pin(decode_sse(resp.bytes_stream())))
    }
}

fn decode_response(body: GenerateResponse) -> Result<LlmResponse, LlmError> {
    let candidate = body
        .candidates
        .first()
        .ok_or_else(|| LlmError::Provider("empty candidates".into()))?;

    let mut content = Vec::new();
    let mut text = String::new();

    for part in &candidate.content.parts {
        match part {
            WirePart::Text { text: t } if !t.is_empty() => {
                text.push_str(t);
                content.push(ContentBlock::Text { text: t.clone() });
            }
            WirePart::FunctionCall { function_call } => {
                content.push(ContentBlock::ToolUse {
                    id: format!("call_{}", function_call.name),
                    name: function_call.name.clone(),
                    input: function_call.args.clone(),
                });
            }
            _ => {}
        }
    }

    Ok(LlmResponse {
        text,
        content,
        input_tokens: body.usage_metadata.as_ref().map(|u| u.prompt_token_count),
        output_tokens: body
            .usage_metadata
            .as_ref()
            .map(|u| u.candidates_token_count),
        stop_reason: normalize_finish_reason(candidate.finish_reason.as_deref()),
    })
}

fn normalize_finish_reason(reason: Option<&str>) -> Option<String> {
    match reason {
        Some("STOP") => Some("end_turn".to_string()),
        Some("MAX_TOKENS") => Some("max_tokens".to_string()),
        Some(other) => Some(other.to_lowercase()),
        None => None,
    }
}

fn decode_sse(
    byte_stream: impl futures_core::Stream<Item = Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl futures_core::Stream<Item = Result<StreamChunk, LlmError>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(piece) = byte_stream.next().await {
            let bytes = match piece {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(LlmError::TransientNetwork(format!("stream error: {e}")));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find("\n\n") {
                let event_text = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                for line in event_text.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let response = match serde_json::from_str::<GenerateResponse>(data) {
                        Ok(response) => response,
                        Err(e) => {
                            yield Err(LlmError::Provider(format!("invalid sse payload: {e}")));
                            return;
                        }
                    };
                    let Some(candidate) = response.candidates.first() else {
                        continue;
                    };

                    for part in &candidate.content.parts {
                        if let WirePart::Text { text } = part {
                            if !text.is_empty() {
                                yield Ok(StreamChunk {
                                    delta: text.clone(),
                                    is_final: false,
                                    stop_reason: None,
                                });
                            }
                        }
                    }

                    if candidate.finish_reason.is_some() {
                        yield Ok(StreamChunk {
                            delta: String::new(),
                            is_final: true,
                            stop_reason: normalize_finish_reason(
                                candidate.finish_reason.as_deref(),
                            ),
                        });
                    }
                }
            }
        }
    }
}

// Wire types, camelCase per the REST API.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContent {
    role: String,
    parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: WireFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: WireFunctionResponse,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: WireBlob,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
