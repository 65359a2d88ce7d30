//! Grounded web search through the Gemini search tool.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use murmur_schema::{Source, ToolErrorKind, ToolExecutionResult};

use crate::tool::{ToolContext, ToolDecl, ToolExecutor};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 20;

pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    enabled: bool,
    priority: i32,
}

impl WebSearchTool {
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
        }
    }

    fn search_prompt(query: &str) -> String {
        let today = Utc::now().format("%Y-%m-%d");
        format!(
            "請搜尋「{query}」的最新資訊（今天是 {today}），整理重點並保持簡潔。"
        )
    }
}

#[async_trait]
impl ToolExecutor for WebSearchTool {
    fn decl(&self) -> ToolDecl {
        ToolDecl {
            name: "web_search".into(),
            description: "搜尋網路上的最新資訊，回傳整理後的重點與來源連結。".into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "搜尋關鍵字或問題"
                    }
                },
                "required": ["query"]
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
        let Some(query) = args["query"].as_str().filter(|q| !q.trim().is_empty()) else {
            return Ok(ToolExecutionResult::failed(
                task_id,
                "web_search",
                ToolErrorKind::InvalidArguments,
                "缺少 query 參數",
            ));
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": Self::search_prompt(query)}]
            }],
            "tools": [{"google_search": {}}],
            "generationConfig": {"temperature": 0}
        });

        let resp = match self.client.post(&url).json(&payload).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(ToolExecutionResult::failed(
                    task_id,
                    "web_search",
                    ToolErrorKind::Network,
                    format!("搜尋請求失敗: {e}"),
                ));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(ToolExecutionResult::failed(
                task_id,
                "web_search",
                ToolErrorKind::Network,
                format!("搜尋服務回應 {status}: {body}"),
            ));
        }

        let body: SearchResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(ToolExecutionResult::failed(
                    task_id,
                    "web_search",
                    ToolErrorKind::Internal,
                    format!("搜尋回應無法解析: {e}"),
                ));
            }
        };

        let (text, sources) = digest_response(body, query);
        if text.is_empty() {
            return Ok(ToolExecutionResult::failed(
                task_id,
                "web_search",
                ToolErrorKind::Internal,
                format!("針對「{query}」沒有找到內容"),
            ));
        }

        let mut result = ToolExecutionResult::ok(task_id, "web_search", text);
        result.sources = sources;
        Ok(result)
    }
}

/// Flatten the grounded answer into prose plus a numbered source list.
fn digest_response(body: SearchResponse, query: &str) -> (String, Vec<Source>) {
    let Some(candidate) = body.candidates.into_iter().next() else {
        return (String::new(), Vec::new());
    };

    let text: String = candidate
        .content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    let mut sources = Vec::new();
    if let Some(grounding) = candidate.grounding_metadata {
        for chunk in grounding.grounding_chunks {
            let Some(web) = chunk.web else { continue };
            if sources.iter().any(|s: &Source| s.url == web.uri) {
                continue;
            }
            sources.push(Source {
                title: if web.title.is_empty() {
                    query.to_string()
                } else {
                    web.title
                },
                url: web.uri,
                snippet: String::new(),
            });
        }
    }

    if text.is_empty() {
        return (text, sources);
    }

    let mut content = text;
    if !sources.is_empty() {
        content.push_str("\n\n來源:");
        for (i, source) in sources.iter().enumerate() {
            content.push_str(&format!("\n{}. {} - {}", i + 1, source.title, source.url));
        }
    }
    (content, sources)
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    candidates: Vec<SearchCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchCandidate {
    content: SearchContent,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct SearchContent {
    #[serde(default)]
    parts: Vec<SearchPart>,
}

#[derive(Debug, Deserialize)]
struct SearchPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<GroundingWeb>,
}

#[derive(Debug, Deserialize)]
struct GroundingWeb {
    uri: String,
    #[serde(default)]
    title: String,
}
