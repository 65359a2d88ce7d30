//! The orchestration graph: plan → execute → reflect → finalize.
//!
//! Nodes are sequential; execute fans its tool calls out concurrently. The
//! graph owns no transport knowledge: progress goes through the injected
//! bus, tools through the registry, models through the role gateway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use murmur_config::{AgentBehaviorConfig, StreamingConfig};
use murmur_provider::{ContentBlock, LlmMessage, RoleGateway};
use murmur_schema::{
    AgentPlan, CancelToken, ChatMessage, Content, ContentPart, CoreError, LlmError, ProgressStage,
    ReminderDetails, Role, Source, ToolCall, ToolExecutionResult,
};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;

use crate::emoji::{EmojiRegistry, StreamTokenGuard};
use crate::persona::PersonaStore;
use crate::progress::ProgressBus;
use crate::tool::{BoundPlanner, ToolContext, ToolRegistry};
use crate::tools::video_summary::{canonical_video_url, extract_video_id};

const RESEARCH_TOPIC_MAX_CHARS: usize = 200;
const RESULT_SNIPPET_MAX_CHARS: usize = 4000;

const STATUS_PENDING: &str = "⚪";
const STATUS_RUNNING: &str = "🔄";
const STATUS_OK: &str = "✅";
const STATUS_FAILED: &str = "❌";

#[derive(Debug, Clone)]
pub struct BehaviorSettings {
    pub max_tool_rounds: u32,
    pub timeout_per_round: Duration,
    pub enable_reflection: bool,
}

impl From<&AgentBehaviorConfig> for BehaviorSettings {
    fn from(config: &AgentBehaviorConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds,
            timeout_per_round: Duration::from_secs(config.timeout_per_round),
            enable_reflection: config.enable_reflection,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub enabled: bool,
    pub min_content_length: usize,
    pub timeout: Duration,
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_content_length: config.min_content_length,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

/// Per-invocation state. Born at admission, discarded at termination.
#[derive(Debug, Default)]
pub struct GraphState {
    pub messages: Vec<ChatMessage>,
    pub tool_round: u32,
    pub plan: Option<AgentPlan>,
    pub research_topic: String,
    pub tool_results: Vec<ToolExecutionResult>,
    pub aggregated_tool_results: Vec<ToolExecutionResult>,
    pub is_sufficient: bool,
    pub reflection_reasoning: String,
    pub final_answer: String,
    pub sources: Vec<Source>,
    pub finished: bool,
    pub current_persona: Option<String>,
    pub global_metadata: String,
    pub reminders: Vec<ReminderDetails>,
    agg_priorities: Vec<i32>,
    agg_seen: HashSet<String>,
    all_failed_last_round: bool,
}

impl GraphState {
    pub fn new(messages: Vec<ChatMessage>, global_metadata: impl Into<String>) -> Self {
        Self {
            messages,
            global_metadata: global_metadata.into(),
            ..Self::default()
        }
    }

    fn latest_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default()
    }

    /// Merge one round's result, keeping priority-then-insertion order and
    /// dropping exact duplicates of already-seen content (first seen wins).
    fn merge_result(&mut self, priority: i32, result: ToolExecutionResult) {
        let key = result.content.trim().to_string();
        if !key.is_empty() && !self.agg_seen.insert(key) {
            return;
        }
        let at = self
            .agg_priorities
            .iter()
            .position(|p| *p > priority)
            .unwrap_or(self.agg_priorities.len());
        self.agg_priorities.insert(at, priority);
        self.aggregated_tool_results.insert(at, result);
    }

    fn merge_sources(&mut self, sources: &[Source]) {
        for source in sources {
            if !self.sources.iter().any(|s| s.url == source.url) {
                self.sources.push(source.clone());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_answer: String,
    pub sources: Vec<Source>,
    pub reminders: Vec<ReminderDetails>,
    pub tool_rounds: u32,
    pub persona: Option<String>,
}

pub struct AgentGraph {
    gateway: Arc<RoleGateway>,
    registry: Arc<ToolRegistry>,
    personas: Arc<PersonaStore>,
    emoji: Arc<EmojiRegistry>,
    behavior: BehaviorSettings,
    streaming: StreamSettings,
}

impl AgentGraph {
    pub fn new(
        gateway: Arc<RoleGateway>,
        registry: Arc<ToolRegistry>,
        personas: Arc<PersonaStore>,
        emoji: Arc<EmojiRegistry>,
        behavior: BehaviorSettings,
        streaming: StreamSettings,
    ) -> Self {
        Self {
            gateway,
            registry,
            personas,
            emoji,
            behavior,
            streaming,
        }
    }

    /// Run one invocation to completion. The caller owns terminal bus
    /// notifications for errors; on success the completion is emitted here.
    pub async fn run(
        &self,
        mut state: GraphState,
        bus: &ProgressBus,
        ctx: &ToolContext,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, CoreError> {
        bus.set_context(truncate_chars(&state.latest_user_text(), 200));
        bus.emit_stage(ProgressStage::Starting, Some(5)).await;

        loop {
            check_cancel(cancel)?;
            self.plan_node(&mut state, bus, cancel).await?;
            let needs_tools = state.plan.as_ref().map(|p| p.needs_tools).unwrap_or(false);
            if !needs_tools {
                break;
            }

            self.execute_node(&mut state, bus, ctx, cancel).await?;
            debug_assert!(state.tool_round <= self.behavior.max_tool_rounds);

            if state.tool_round >= self.behavior.max_tool_rounds {
                state.is_sufficient = true;
                break;
            }
            if !self.behavior.enable_reflection {
                state.is_sufficient = true;
                break;
            }
            self.reflect_node(&mut state, bus, cancel).await?;
            if state.is_sufficient {
                break;
            }
        }

        check_cancel(cancel)?;
        self.finalize_node(&mut state, bus, ctx, cancel).await?;
        state.finished = true;

        Ok(RunOutcome {
            final_answer: state.final_answer,
            sources: state.sources,
            reminders: state.reminders,
            tool_rounds: state.tool_round,
            persona: state.current_persona,
        })
    }

    async fn plan_node(
        &self,
        state: &mut GraphState,
        bus: &ProgressBus,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        if state.current_persona.is_none() {
            if let Some(persona) = self.personas.choose() {
                tracing::debug!(persona = %persona.name, "persona selected");
                state.current_persona = Some(persona.name.clone());
            }
        }
        bus.emit_stage(ProgressStage::GenerateQuery, Some(20)).await;

        if state.research_topic.is_empty() {
            state.research_topic = truncate_chars(&state.latest_user_text(), RESEARCH_TOPIC_MAX_CHARS);
        }

        if self.behavior.max_tool_rounds == 0 {
            state.plan = Some(AgentPlan::without_tools("工具輪次為零，直接回答"));
            return Ok(());
        }

        // Deterministic pre-detection on every plan entry: a recognized
        // video link always gets a summary call, placed ahead of whatever
        // the planner decides. Later rounds hit the summary cache.
        let mut predetected = Vec::new();
        if self.registry.is_enabled("video_summary") {
            if let Some(video_id) = extract_video_id(&state.latest_user_text()) {
                predetected.push(ToolCall {
                    name: "video_summary".into(),
                    arguments: serde_json::json!({ "url": canonical_video_url(&video_id) }),
                    priority: self.registry.priority_of("video_summary"),
                    task_id: uuid::Uuid::new_v4().to_string(),
                });
            }
        }

        let planner = BoundPlanner::new(Arc::clone(&self.registry), Arc::clone(&self.gateway));
        let system = self.planner_system(state);
        let messages = self.conversation_for_model(state, true);
        let llm_plan = match planner.plan(Some(system), messages, cancel).await {
            Ok(plan) => plan,
            Err(LlmError::Cancelled) => return Err(CoreError::Cancelled),
            Err(LlmError::InvalidStructuredOutput(reason)) => {
                tracing::warn!("planner returned unparseable tool calls, answering directly: {reason}");
                AgentPlan::without_tools("規劃輸出無法解析")
            }
            Err(e) => return Err(CoreError::Llm(e)),
        };

        let mut calls = predetected;
        for call in llm_plan.tool_calls {
            let duplicate = calls
                .iter()
                .any(|c| c.name == call.name && c.arguments == call.arguments);
            if !duplicate {
                calls.push(call);
            }
        }

        state.plan = Some(AgentPlan {
            needs_tools: !calls.is_empty(),
            tool_calls: calls,
            reasoning: llm_plan.reasoning,
        });
        Ok(())
    }

    async fn execute_node(
        &self,
        state: &mut GraphState,
        bus: &ProgressBus,
        ctx: &ToolContext,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let calls = state
            .plan
            .as_ref()
            .map(|p| p.tool_calls.clone())
            .unwrap_or_default();
        if calls.is_empty() {
            state.tool_round += 1;
            return Ok(());
        }

        let mut statuses: Vec<&str> = vec![STATUS_PENDING; calls.len()];
        bus.emit(status_event(&calls, &statuses)).await;
        statuses.fill(STATUS_RUNNING);
        bus.emit_stage(ProgressStage::Searching, Some(40)).await;

        let timeout = ToolRegistry::per_call_timeout(self.behavior.timeout_per_round, calls.len());
        let mut join_set: JoinSet<(usize, ToolExecutionResult)> = JoinSet::new();
        for (idx, call) in calls.iter().cloned().enumerate() {
            let registry = Arc::clone(&self.registry);
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let result = registry.dispatch(&call, &ctx, timeout).await;
                (idx, result)
            });
        }

        let mut indexed: Vec<Option<ToolExecutionResult>> = vec![None; calls.len()];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(CoreError::Cancelled);
                }
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((idx, result)) => {
                            statuses[idx] = if result.success { STATUS_OK } else { STATUS_FAILED };
                            bus.emit(status_event(&calls, &statuses)).await;
                            indexed[idx] = Some(result);
                        }
                        Err(e) => tracing::warn!("tool task join failure: {e}"),
                    }
                }
            }
        }

        let results: Vec<ToolExecutionResult> = indexed
            .into_iter()
            .enumerate()
            .map(|(idx, r)| {
                r.unwrap_or_else(|| {
                    ToolExecutionResult::failed(
                        &calls[idx].task_id,
                        &calls[idx].name,
                        murmur_schema::ToolErrorKind::Internal,
                        "工具任務中斷",
                    )
                })
            })
            .collect();

        state.all_failed_last_round = results.iter().all(|r| !r.success);
        for (idx, result) in results.iter().enumerate() {
            if result.success {
                self.ingest_success(state, calls[idx].priority, result);
            }
        }
        state.tool_results = results;
        state.tool_round += 1;
        bus.emit_stage(ProgressStage::Analyzing, Some(60)).await;
        Ok(())
    }

    fn ingest_success(&self, state: &mut GraphState, priority: i32, result: &ToolExecutionResult) {
        state.merge_sources(&result.sources);
        if let Some(reminder) = &result.side_effect {
            state.reminders.push(reminder.clone());
        }
        state.merge_result(priority, result.clone());
    }

    async fn reflect_node(
        &self,
        state: &mut GraphState,
        bus: &ProgressBus,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        bus.emit_stage(ProgressStage::Reflection, Some(70)).await;

        let summaries = state
            .aggregated_tool_results
            .iter()
            .map(|r| truncate_chars(&r.content, RESULT_SNIPPET_MAX_CHARS))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let prompt = format!(
            "研究主題：{}\n\n目前蒐集到的資料：\n{}\n\n\
             請判斷這些資料是否足夠回答使用者的問題。\
             回傳 JSON：{{\"is_sufficient\": true|false, \"reasoning\": \"原因\"}}",
            state.research_topic,
            if summaries.is_empty() { "（沒有任何資料）" } else { &summaries }
        );

        match self.gateway.reflect(None, prompt, cancel).await {
            Ok(verdict) => {
                state.is_sufficient = verdict.is_sufficient;
                state.reflection_reasoning = verdict.reasoning;
            }
            Err(LlmError::Cancelled) => return Err(CoreError::Cancelled),
            Err(e) => {
                tracing::warn!("reflection failed, assuming sufficient: {e}");
                state.is_sufficient = true;
                state.reflection_reasoning = String::new();
            }
        }

        if state.all_failed_last_round {
            state.is_sufficient = false;
        }
        Ok(())
    }

    async fn finalize_node(
        &self,
        state: &mut GraphState,
        bus: &ProgressBus,
        ctx: &ToolContext,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        bus.emit_stage(ProgressStage::FinalizeAnswer, Some(80)).await;
        let guild = ctx.guild_ref.clone();

        let use_streaming = self.streaming.enabled
            && bus.has_observers()
            && self.projected_length(state) >= self.streaming.min_content_length;

        let answer = if use_streaming {
            self.finalize_streaming(state, bus, guild.as_deref(), cancel)
                .await?
        } else {
            let text = self.finalize_whole(state, guild.as_deref(), cancel).await?;
            self.emoji.repair(&text, guild.as_deref())
        };

        state.final_answer = answer;
        bus.complete(state.final_answer.clone(), state.sources.clone());
        bus.emit_stage(ProgressStage::Completed, Some(100)).await;
        Ok(())
    }

    /// Whole-answer path, with one oldest-first history drop on overflow.
    async fn finalize_whole(
        &self,
        state: &mut GraphState,
        guild: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<String, CoreError> {
        let (system, messages) = self.final_prompt(state, guild);
        match self.gateway.finalize(Some(system), messages, cancel).await {
            Ok(text) => Ok(text),
            Err(LlmError::ContextOverflow(reason)) => {
                tracing::warn!("finalizer context overflow, dropping oldest history: {reason}");
                drop_oldest_history(state);
                let (system, messages) = self.final_prompt(state, guild);
                self.gateway
                    .finalize(Some(system), messages, cancel)
                    .await
                    .map_err(map_llm_error)
            }
            Err(e) => Err(map_llm_error(e)),
        }
    }

    async fn finalize_streaming(
        &self,
        state: &mut GraphState,
        bus: &ProgressBus,
        guild: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<String, CoreError> {
        let (system, messages) = self.final_prompt(state, guild);
        let mut stream = match self
            .gateway
            .finalize_stream(Some(system), messages, cancel)
            .await
        {
            Ok(stream) => stream,
            Err(LlmError::ContextOverflow(reason)) => {
                tracing::warn!("finalizer context overflow, dropping oldest history: {reason}");
                drop_oldest_history(state);
                let (system, messages) = self.final_prompt(state, guild);
                self.gateway
                    .finalize_stream(Some(system), messages, cancel)
                    .await
                    .map_err(map_llm_error)?
            }
            Err(e) => return Err(map_llm_error(e)),
        };

        bus.emit_stage(ProgressStage::Streaming, Some(90)).await;

        // Emoji repair runs at flush boundaries only; the guard keeps a
        // token from ever splitting across two chunks.
        let mut guard = StreamTokenGuard::new();
        let mut full = String::new();
        let deadline = tokio::time::Instant::now() + self.streaming.timeout;

        loop {
            let item = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    bus.emit_stage(ProgressStage::Timeout, None).await;
                    return Err(CoreError::Llm(LlmError::TransientNetwork(
                        "finalizer stream timed out".into(),
                    )));
                }
            };
            match item {
                None => break,
                Some(Ok(chunk)) => {
                    if !chunk.delta.is_empty() {
                        if let Some(safe) = guard.push(&chunk.delta) {
                            let repaired = self.emoji.repair(&safe, guild);
                            full.push_str(&repaired);
                            bus.chunk(repaired, false);
                        }
                    }
                    if chunk.is_final {
                        break;
                    }
                }
                Some(Err(LlmError::Cancelled)) => return Err(CoreError::Cancelled),
                Some(Err(e)) => return Err(map_llm_error(e)),
            }
        }

        match guard.flush() {
            Some(rest) => {
                let repaired = self.emoji.repair(&rest, guild);
                full.push_str(&repaired);
                bus.chunk(repaired, true);
            }
            None => bus.chunk(String::new(), true),
        }
        bus.streaming_complete();
        Ok(full)
    }

    /// Rough size guess used only to skip streaming for tiny answers.
    fn projected_length(&self, state: &GraphState) -> usize {
        let results: usize = state
            .aggregated_tool_results
            .iter()
            .map(|r| r.content.chars().count())
            .sum();
        results + state.latest_user_text().chars().count()
    }

    fn planner_system(&self, state: &GraphState) -> String {
        let mut parts = vec![
            "你是對話助手的規劃模組。閱讀對話後判斷是否需要呼叫工具取得外部資訊：\
             需要最新資訊、事實查證、影片摘要或設定提醒時呼叫合適的工具，否則不要呼叫任何工具。"
                .to_string(),
        ];
        if state.tool_round > 0 {
            parts.push(format!(
                "已經完成 {} 輪工具呼叫，僅在現有資料不足時才補充新的工具呼叫。",
                state.tool_round
            ));
        }
        parts.join("\n")
    }

    fn final_prompt(&self, state: &GraphState, guild: Option<&str>) -> (String, Vec<LlmMessage>) {
        let mut system = Vec::new();
        if let Some(name) = &state.current_persona {
            if let Some(persona) = self.personas.get(name) {
                system.push(persona.prompt.clone());
            }
        }
        if system.is_empty() {
            system.push("你是一個友善、聰明的聊天助手，用自然的語氣回答。".to_string());
        }
        if !state.global_metadata.is_empty() {
            system.push(format!("對話環境：{}", state.global_metadata));
        }
        system.push(format!("現在時間：{}", chrono::Utc::now().to_rfc3339()));
        let emoji_context = self.emoji.prompt_context(guild);
        if !emoji_context.is_empty() {
            system.push(emoji_context);
        }

        let mut messages = self.conversation_for_model(state, false);
        if !state.aggregated_tool_results.is_empty() {
            let mut block = String::from("以下是為了回答這個問題蒐集到的資料：\n");
            for (i, result) in state.aggregated_tool_results.iter().enumerate() {
                block.push_str(&format!(
                    "{}. [{}] {}\n",
                    i + 1,
                    result.tool_name,
                    truncate_chars(&result.content, RESULT_SNIPPET_MAX_CHARS)
                ));
            }
            block.push_str("請整合這些資料，用自然的語氣回答使用者。");
            messages.push(LlmMessage::user(block));
        }
        (system.join("\n\n"), messages)
    }

    fn conversation_for_model(&self, state: &GraphState, text_only: bool) -> Vec<LlmMessage> {
        state
            .messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                let content = match &message.content {
                    Content::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
                    Content::Parts(parts) => parts
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::Text { text } => {
                                Some(ContentBlock::Text { text: text.clone() })
                            }
                            ContentPart::InlineImage { mime, data_b64 } if !text_only => {
                                Some(ContentBlock::InlineImage {
                                    mime: mime.clone(),
                                    data_b64: data_b64.clone(),
                                })
                            }
                            ContentPart::InlineImage { .. } => None,
                            ContentPart::ToolResultRef { task_id } => Some(ContentBlock::Text {
                                text: format!("[工具結果 {task_id}]"),
                            }),
                        })
                        .collect(),
                };
                LlmMessage {
                    role: role.into(),
                    content,
                }
            })
            .filter(|m| !m.content.is_empty())
            .collect()
    }
}

fn status_event(calls: &[ToolCall], statuses: &[&str]) -> murmur_schema::ProgressEvent {
    let line = calls
        .iter()
        .zip(statuses)
        .map(|(call, status)| format!("{status}{}", call.name))
        .collect::<Vec<_>>()
        .join(" ");
    murmur_schema::ProgressEvent::stage(ProgressStage::ToolStatus)
        .with_message(format!("工具執行: {line}"))
}

fn check_cancel(cancel: &CancelToken) -> Result<(), CoreError> {
    if cancel.is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

fn map_llm_error(e: LlmError) -> CoreError {
    match e {
        LlmError::Cancelled => CoreError::Cancelled,
        other => CoreError::Llm(other),
    }
}

/// Drop the oldest half of the history, always keeping the latest message.
fn drop_oldest_history(state: &mut GraphState) {
    let len = state.messages.len();
    if len > 1 {
        state.messages.drain(..len / 2);
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::RecordingObserver;
    use crate::progress::{ObserverSettings, ProgressBus};
    use crate::tool::{ToolDecl, ToolExecutor};
    use async_trait::async_trait;
    use murmur_provider::{GatewaySettings, LlmProvider, LlmRequest, LlmResponse, RoleSettings};
    use std::sync::Mutex;

    /// Provider that pops scripted responses per call; planner calls are the
    /// ones carrying tool definitions.
    struct ScriptedProvider {
        responses: Mutex<Vec<LlmResponse>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn text(text: &str) -> LlmResponse {
            LlmResponse {
                text: text.into(),
                content: vec![ContentBlock::Text { text: text.into() }],
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("end_turn".into()),
            }
        }

        fn tool_use(calls: &[(&str, serde_json::Value)]) -> LlmResponse {
            LlmResponse {
                text: String::new(),
                content: calls
                    .iter()
                    .map(|(name, input)| ContentBlock::ToolUse {
                        id: format!("call_{name}"),
                        name: (*name).into(),
                        input: input.clone(),
                    })
                    .collect(),
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("tool_use".into()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ScriptedProvider::text("（預設回覆）"))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct StaticTool {
        name: &'static str,
        priority: i32,
        content: &'static str,
        sources: Vec<Source>,
        delay: Duration,
        fail: bool,
    }

    impl StaticTool {
        fn ok(name: &'static str, priority: i32, content: &'static str) -> Self {
            Self {
                name,
                priority,
                content,
                sources: vec![],
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for StaticTool {
        fn decl(&self) -> ToolDecl {
            ToolDecl {
                name: self.name.into(),
                description: "test tool".into(),
                schema: serde_json::json!({"type": "object"}),
                enabled: true,
                priority: self.priority,
            }
        }

        async fn execute(
            &self,
            task_id: &str,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolExecutionResult> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("tool exploded");
            }
            let mut result = ToolExecutionResult::ok(task_id, self.name, self.content);
            result.sources = self.sources.clone();
            Ok(result)
        }
    }

    fn gateway(provider: Arc<dyn LlmProvider>) -> Arc<RoleGateway> {
        let role = |model: &str| RoleSettings {
            model: model.into(),
            temperature: 0.5,
            max_output_tokens: 512,
        };
        Arc::new(RoleGateway::new(
            provider,
            GatewaySettings {
                planner: role("planner"),
                finalizer: role("finalizer"),
                reflector: role("reflector"),
                blurb: role("blurb"),
                retry_attempts: 1,
            },
        ))
    }

    fn graph(
        provider: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        max_rounds: u32,
        enable_reflection: bool,
    ) -> AgentGraph {
        AgentGraph::new(
            gateway(provider),
            Arc::new(registry),
            Arc::new(PersonaStore::empty()),
            Arc::new(EmojiRegistry::default()),
            BehaviorSettings {
                max_tool_rounds: max_rounds,
                timeout_per_round: Duration::from_secs(30),
                enable_reflection,
            },
            StreamSettings {
                enabled: false,
                min_content_length: 0,
                timeout: Duration::from_secs(60),
            },
        )
    }

    fn ctx() -> ToolContext {
        ToolContext::new("chan", "user", chrono_tz::Tz::UTC)
    }

    async fn run_to_outcome(
        graph: &AgentGraph,
        state: GraphState,
        observer: Arc<RecordingObserver>,
    ) -> RunOutcome {
        let mut bus = ProgressBus::plain();
        bus.register(observer, ObserverSettings::default());
        let outcome = graph
            .run(state, &bus, &ctx(), &CancelToken::new())
            .await
            .unwrap();
        bus.close().await;
        outcome
    }

    #[tokio::test]
    async fn zero_rounds_goes_straight_to_finalize() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text(
            "嗨！很高興見到你～",
        )]));
        let graph = graph(provider, ToolRegistry::new(), 0, true);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("hi")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.tool_rounds, 0);
        assert_eq!(outcome.final_answer, "嗨！很高興見到你～");
        assert_eq!(observer.completions.lock().unwrap().len(), 1);
        assert!(observer.chunks.lock().unwrap().is_empty());
        // No tool stages ever fired.
        assert!(!observer
            .events()
            .iter()
            .any(|e| e.contains("tool_status") || e.contains("searching")));
    }

    #[tokio::test]
    async fn single_round_aggregates_results_and_sources() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool {
            name: "web_search",
            priority: 1,
            content: "Rust 1.80 於 2024 年發布。",
            sources: vec![Source {
                title: "Rust Blog".into(),
                url: "https://blog.rust-lang.org".into(),
                snippet: String::new(),
            }],
            delay: Duration::ZERO,
            fail: false,
        }));
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_use(&[("web_search", serde_json::json!({"query": "rust"}))]),
            ScriptedProvider::text("Rust 1.80 已經發布囉！"),
        ]));
        let graph = graph(provider, registry, 1, true);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("rust 最新版本？")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.tool_rounds, 1);
        assert_eq!(outcome.sources.len(), 1);
        assert!(outcome.final_answer.contains("Rust 1.80"));

        let events = observer.events();
        let order: Vec<&str> = ["generate_query", "tool_status", "searching", "finalize_answer", "completed"]
            .into_iter()
            .filter(|stage| events.iter().any(|e| e.contains(stage)))
            .collect();
        assert_eq!(
            order,
            vec!["generate_query", "tool_status", "searching", "finalize_answer", "completed"]
        );
        // Stage order is preserved in the emitted sequence.
        let pos = |needle: &str| events.iter().position(|e| e.contains(needle)).unwrap();
        assert!(pos("generate_query") < pos("tool_status"));
        assert!(pos("tool_status") < pos("searching"));
        assert!(pos("finalize_answer") < pos("completed"));
    }

    #[tokio::test]
    async fn parallel_tools_order_by_priority_and_survive_one_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool {
            name: "alpha",
            priority: 2,
            content: "alpha result",
            sources: vec![],
            delay: Duration::from_millis(30),
            fail: false,
        }));
        registry.register(Arc::new(StaticTool {
            name: "beta",
            priority: 1,
            content: "beta result",
            sources: vec![],
            delay: Duration::from_millis(5),
            fail: false,
        }));
        registry.register(Arc::new(StaticTool {
            name: "gamma",
            priority: 3,
            content: "gamma result",
            sources: vec![],
            delay: Duration::ZERO,
            fail: true,
        }));

        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_use(&[
                ("alpha", serde_json::json!({})),
                ("beta", serde_json::json!({})),
                ("gamma", serde_json::json!({})),
            ]),
            ScriptedProvider::text("整理好了"),
        ]));
        let graph = graph(provider, registry, 1, true);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("查三件事")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.final_answer, "整理好了");
        assert_eq!(observer.completions.lock().unwrap().len(), 1);
        assert!(observer.errors.lock().unwrap().is_empty());
        // gamma failed; the successes aggregate by priority.
        // (aggregation is observable through the outcome's tool_rounds and
        // the state merge covered below)
        assert_eq!(outcome.tool_rounds, 1);
    }

    #[tokio::test]
    async fn reflection_insufficient_triggers_second_round() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::ok("web_search", 1, "第一批資料")));

        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_use(&[("web_search", serde_json::json!({"query": "a"}))]),
            ScriptedProvider::text("{\"is_sufficient\": false, \"reasoning\": \"還不夠\"}"),
            ScriptedProvider::tool_use(&[("web_search", serde_json::json!({"query": "b"}))]),
            ScriptedProvider::text("夠了，回答如下。"),
        ]));
        let graph = graph(provider, registry, 2, true);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("深入研究一下")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.tool_rounds, 2);
        assert!(observer.events().iter().any(|e| e.contains("reflection")));
    }

    #[tokio::test]
    async fn reflection_disabled_finishes_after_one_round() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::ok("web_search", 1, "資料")));
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_use(&[("web_search", serde_json::json!({"query": "a"}))]),
            ScriptedProvider::text("回答"),
        ]));
        let graph = graph(provider, registry, 3, false);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("q")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.tool_rounds, 1);
        assert!(!observer.events().iter().any(|e| e.contains("reflection")));
    }

    #[tokio::test]
    async fn short_expected_answers_skip_streaming() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text("短答")]));
        let graph = AgentGraph::new(
            gateway(provider),
            Arc::new(ToolRegistry::new()),
            Arc::new(PersonaStore::empty()),
            Arc::new(EmojiRegistry::default()),
            BehaviorSettings {
                max_tool_rounds: 0,
                timeout_per_round: Duration::from_secs(30),
                enable_reflection: true,
            },
            StreamSettings {
                enabled: true,
                min_content_length: 10_000,
                timeout: Duration::from_secs(30),
            },
        );
        let observer = Arc::new(RecordingObserver::default());
        let outcome = run_to_outcome(
            &graph,
            GraphState::new(vec![ChatMessage::user("hi")], ""),
            observer.clone(),
        )
        .await;
        assert_eq!(outcome.final_answer, "短答");
        assert!(observer.chunks.lock().unwrap().is_empty());
        assert_eq!(observer.completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_without_completion() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let graph = graph(provider, ToolRegistry::new(), 0, true);
        let mut bus = ProgressBus::plain();
        let observer = Arc::new(RecordingObserver::default());
        bus.register(observer.clone(), ObserverSettings::default());

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = graph
            .run(
                GraphState::new(vec![ChatMessage::user("hi")], ""),
                &bus,
                &ctx(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        bus.close().await;
        assert!(observer.completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_planner_output_degrades_to_direct_answer() {
        struct BrokenPlanner;

        #[async_trait]
        impl LlmProvider for BrokenPlanner {
            async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
                if !request.tools.is_empty() {
                    Err(LlmError::InvalidStructuredOutput("not json".into()))
                } else {
                    Ok(ScriptedProvider::text("直接回答"))
                }
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::ok("web_search", 1, "unused")));
        let graph = graph(Arc::new(BrokenPlanner), registry, 2, true);
        let observer = Arc::new(RecordingObserver::default());
        let state = GraphState::new(vec![ChatMessage::user("查一下")], "");

        let outcome = run_to_outcome(&graph, state, observer.clone()).await;
        assert_eq!(outcome.tool_rounds, 0);
        assert_eq!(outcome.final_answer, "直接回答");
    }

    #[test]
    fn merge_result_orders_by_priority_then_insertion_and_dedupes() {
        let mut state = GraphState::default();
        state.merge_result(2, ToolExecutionResult::ok("t1", "a", "second"));
        state.merge_result(1, ToolExecutionResult::ok("t2", "b", "first"));
        state.merge_result(2, ToolExecutionResult::ok("t3", "c", "third"));
        // Duplicate content arrives later with a better priority: first wins.
        state.merge_result(0, ToolExecutionResult::ok("t4", "d", "second"));

        let contents: Vec<&str> = state
            .aggregated_tool_results
            .iter()
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn research_topic_is_truncated() {
        let long = "問".repeat(300);
        let state = GraphState::new(vec![ChatMessage::user(long)], "");
        assert_eq!(
            truncate_chars(&state.latest_user_text(), RESEARCH_TOPIC_MAX_CHARS)
                .chars()
                .count(),
            200
        );
    }

    #[test]
    fn drop_oldest_history_keeps_latest() {
        let mut state = GraphState::new(
            (0..6).map(|i| ChatMessage::user(format!("m{i}"))).collect(),
            "",
        );
        drop_oldest_history(&mut state);
        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages.last().unwrap().text(), "m5");
    }
}
