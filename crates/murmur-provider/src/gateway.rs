//! Role-keyed model gateway.
//!
//! The orchestration graph talks to four logical endpoints (planner,
//! finalizer, reflector, progress blurb), each with its own model,
//! temperature and output budget. Transient failures retry here with
//! exponential backoff; everything else bubbles to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use murmur_schema::{CancelToken, LlmError};
use rand::Rng;
use serde::Deserialize;

use crate::{ChunkStream, LlmMessage, LlmProvider, LlmRequest, LlmResponse, ToolDef};

const BLURB_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;

#[derive(Debug, Clone)]
pub struct RoleSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub planner: RoleSettings,
    pub finalizer: RoleSettings,
    pub reflector: RoleSettings,
    pub blurb: RoleSettings,
    pub retry_attempts: u32,
}

/// Structured verdict returned by the reflector role.
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionVerdict {
    pub is_sufficient: bool,
    #[serde(default)]
    pub reasoning: String,
}

pub struct RoleGateway {
    provider: Arc<dyn LlmProvider>,
    settings: GatewaySettings,
}

impl RoleGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: GatewaySettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    fn request(&self, role: &RoleSettings, system: Option<String>, messages: Vec<LlmMessage>) -> LlmRequest {
        LlmRequest {
            model: role.model.clone(),
            system,
            messages,
            max_tokens: role.max_output_tokens,
            temperature: Some(role.temperature),
            tools: Vec::new(),
        }
    }

    /// Planner call with bound tools. The response may carry tool-use blocks.
    pub async fn plan(
        &self,
        system: Option<String>,
        messages: Vec<LlmMessage>,
        tools: Vec<ToolDef>,
        cancel: &CancelToken,
    ) -> Result<LlmResponse, LlmError> {
        let mut request = self.request(&self.settings.planner, system, messages);
        request.tools = tools;
        self.chat_with_retry(request, cancel).await
    }

    pub async fn finalize(
        &self,
        system: Option<String>,
        messages: Vec<LlmMessage>,
        cancel: &CancelToken,
    ) -> Result<String, LlmError> {
        let request = self.request(&self.settings.finalizer, system, messages);
        Ok(self.chat_with_retry(request, cancel).await?.text)
    }

    /// Streaming finalizer. Mid-stream failures surface as an `Err` item;
    /// cancellation ends the stream with `LlmError::Cancelled`.
    pub async fn finalize_stream(
        &self,
        system: Option<String>,
        messages: Vec<LlmMessage>,
        cancel: &CancelToken,
    ) -> Result<ChunkStream, LlmError> {
        let request = self.request(&self.settings.finalizer, system, messages);
        let inner = with_cancel(cancel, self.provider.stream(request)).await?;
        Ok(cancel_aware_stream(inner, cancel.clone()))
    }

    pub async fn reflect(
        &self,
        system: Option<String>,
        prompt: String,
        cancel: &CancelToken,
    ) -> Result<ReflectionVerdict, LlmError> {
        let request = self.request(
            &self.settings.reflector,
            system,
            vec![LlmMessage::user(prompt)],
        );
        let response = self.chat_with_retry(request, cancel).await?;
        parse_reflection(&response.text)
    }

    /// Tiny progress blurb. Hard 2s timeout; timeouts map to a transient
    /// error so callers can fall back to their static template.
    pub async fn blurb(&self, instruction: String, cancel: &CancelToken) -> Result<String, LlmError> {
        let request = self.request(
            &self.settings.blurb,
            None,
            vec![LlmMessage::user(instruction)],
        );
        let call = self.provider.chat(request);
        match tokio::time::timeout(BLURB_TIMEOUT, with_cancel(cancel, call)).await {
            Ok(result) => Ok(result?.text.trim().to_string()),
            Err(_) => Err(LlmError::TransientNetwork("blurb timed out".into())),
        }
    }

    async fn chat_with_retry(
        &self,
        request: LlmRequest,
        cancel: &CancelToken,
    ) -> Result<LlmResponse, LlmError> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_err = LlmError::Provider("no attempts made".into());

        for attempt in 0..attempts {
            match with_cancel(cancel, self.provider.chat(request.clone())).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retryable model failure: {e}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(4));
    let capped = base.min(RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 5);
    Duration::from_millis(capped + jitter)
}

async fn with_cancel<T>(
    cancel: &CancelToken,
    fut: impl Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        result = fut => result,
    }
}

fn cancel_aware_stream(mut inner: ChunkStream, cancel: CancelToken) -> ChunkStream {
    Box::pin(async_stream::stream! {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    yield Err(LlmError::Cancelled);
                    return;
                }
                item = tokio_stream::StreamExt::next(&mut inner) => {
                    match item {
                        Some(Ok(chunk)) => {
                            let finished = chunk.is_final;
                            yield Ok(chunk);
                            if finished {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    })
}

/// Pulls the first JSON object out of model text, tolerating markdown fences.
fn parse_reflection(text: &str) -> Result<ReflectionVerdict, LlmError> {
    let candidate = extract_json_object(text)
        .ok_or_else(|| LlmError::InvalidStructuredOutput(format!("no JSON object in: {text}")))?;
    serde_json::from_str(&candidate)
        .map_err(|e| LlmError::InvalidStructuredOutput(format!("{e}: {candidate}")))
}

fn extract_json_object(text: &str) -> Option<String> {
    let body = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        match rest.find("```") {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else {
        text
    };

    let start = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in body[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(body[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
