//! Video summarization with an in-process TTL cache.
//!
//! Summaries are keyed by the canonical 11-character video id so different
//! URL spellings of the same video share one cache entry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use murmur_schema::{ToolErrorKind, ToolExecutionResult};

use crate::tool::{ToolContext, ToolDecl, ToolExecutor};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24);

const ID_LEN: usize = 11;
const URL_PREFIXES: &[&str] = &[
    "youtu.be/",
    "youtube.com/watch?v=",
    "youtube.com/embed/",
    "youtube.com/shorts/",
];

/// Canonical video id from the first recognized video URL in `text`.
pub fn extract_video_id(text: &str) -> Option<String> {
    for prefix in URL_PREFIXES {
        let Some(pos) = text.find(prefix) else { continue };
        let candidate: String = text[pos + prefix.len()..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(ID_LEN)
            .collect();
        if candidate.len() == ID_LEN {
            return Some(candidate);
        }
    }
    None
}

pub fn canonical_video_url(id: &str) -> String {
    format!("https://youtu.be/{id}")
}

pub struct VideoSummaryTool {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    enabled: bool,
    priority: i32,
    ttl: Duration,
    cache: RwLock<HashMap<String, (Instant, String)>>,
}

impl VideoSummaryTool {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, enabled: bool, priority: i32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: API_BASE.into(),
            model: model.into(),
            enabled,
            priority,
            ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cache_get(&self, video_id: &str) -> Option<String> {
        let cache = self.cache.read().ok()?;
        let (stored_at, summary) = cache.get(video_id)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(summary.clone())
    }

    /// Write-after-read races are fine: last write wins.
    fn cache_put(&self, video_id: String, summary: String) {
        if let Ok(mut cache) = self.cache.write() {
            let ttl = self.ttl;
            cache.retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);
            cache.insert(video_id, (Instant::now(), summary));
        }
    }

    #[cfg(test)]
    pub fn seed_cache(&self, video_id: &str, summary: &str) {
        self.cache_put(video_id.to_string(), summary.to_string());
    }

    async fn summarize(&self, video_url: &str) -> Result<String, (ToolErrorKind, String)> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"fileData": {"fileUri": video_url, "mimeType": "video/*"}},
                    {"text": "請幫我總結這部影片，並詳細描述整段影片的內容。"}
                ]
            }],
            "generationConfig": {"temperature": 0.3}
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| (ToolErrorKind::Network, format!("影片摘要請求失敗: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err((
                ToolErrorKind::Network,
                format!("影片摘要服務回應 {status}: {body}"),
            ));
        }

        let body: SummaryResponse = resp
            .json()
            .await
            .map_err(|e| (ToolErrorKind::Internal, format!("摘要回應無法解析: {e}")))?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            Err((ToolErrorKind::Internal, "摘要回應為空".into()))
        } else {
            Ok(text)
        }
    }
}

#[async_trait]
impl ToolExecutor for VideoSummaryTool {
    fn decl(&self) -> ToolDecl {
        ToolDecl {
            name: "video_summary".into(),
            description: "為給定的影片連結生成內容摘要，僅接受一個 URL。".into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "要生成摘要的影片 URL"
                    }
                },
                "required": ["url"]
            }),
            enabled: self.enabled,
            priority: self.priority,
        }
    }

    async fn execute(
        &self,
        task_id: &str,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolExecutionResult> {
        let url = args["url"].as_str().unwrap_or_default();
        let Some(video_id) = extract_video_id(url) else {
            return Ok(ToolExecutionResult::failed(
                task_id,
                "video_summary",
                ToolErrorKind::InvalidArguments,
                format!("無效的影片 URL: {url}"),
            ));
        };

        if let Some(summary) = self.cache_get(&video_id) {
            tracing::debug!(video_id = %video_id, "video summary cache hit");
            return Ok(ToolExecutionResult::ok(task_id, "video_summary", summary));
        }

        match self.summarize(&canonical_video_url(&video_id)).await {
            Ok(summary) => {
                self.cache_put(video_id, summary.clone());
                Ok(ToolExecutionResult::ok(task_id, "video_summary", summary))
            }
            Err((kind, message)) => Ok(ToolExecutionResult::failed(
                task_id,
                "video_summary",
                kind,
                message,
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    candidates: Vec<SummaryCandidate>,
}

#[derive(Debug, Deserialize)]
struct SummaryCandidate {
    content: SummaryContent,
}

#[derive(Debug, Deserialize)]
struct SummaryContent {
    #[serde(default)]
    parts: Vec<SummaryPart>,
}

#[derive(Debug, Deserialize)]
struct SummaryPart {
    #[serde(default)]
    text: Option<String>,
}
