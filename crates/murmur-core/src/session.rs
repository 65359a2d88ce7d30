//! Per-request wiring: permissions, trend offer, collection, graph run,
//! reminder side-effect handoff, and the channel cache the trend engine
//! reads from.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use murmur_config::AppConfig;
use murmur_provider::RoleGateway;
use murmur_scheduler::ReminderScheduler;
use murmur_schema::{
    CancelToken, ChatMessage, CoreError, ProgressStage, ReminderDetails, Role, ScheduleError,
    Source,
};
use uuid::Uuid;

use crate::conversation::{CollectRequest, Collector, MediaAttachment};
use crate::emoji::EmojiRegistry;
use crate::graph::{AgentGraph, BehaviorSettings, GraphState, StreamSettings};
use crate::persona::PersonaStore;
use crate::progress::{ObserverSettings, ProgressBus, ProgressObserver};
use crate::tool::{ToolContext, ToolRegistry};
use crate::trend::{TrendContent, TrendEngine, TrendMessage, TrendSink};

const CACHE_MAX_ENTRIES: usize = 50;
const CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub trace_id: Uuid,
    pub channel_ref: String,
    pub guild_ref: Option<String>,
    pub user_ref: String,
    pub role_refs: Vec<String>,
    pub is_dm: bool,
    pub author_is_bot: bool,
    pub text: String,
    pub attachments: Vec<MediaAttachment>,
    pub origin_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn text_only(channel_ref: &str, user_ref: &str, text: &str) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            channel_ref: channel_ref.into(),
            guild_ref: None,
            user_ref: user_ref.into(),
            role_refs: Vec::new(),
            is_dm: false,
            author_is_bot: false,
            text: text.into(),
            attachments: Vec::new(),
            origin_id: None,
            timestamp: Some(Utc::now()),
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Replied {
        final_answer: String,
        sources: Vec<Source>,
        reminder_ids: Vec<String>,
        warnings: Vec<String>,
    },
    ClaimedByTrend,
    Refused {
        reason: String,
        notify_user: bool,
    },
    Failed {
        apology: String,
        code: &'static str,
    },
}

struct CachedEntry {
    at: Instant,
    trend: TrendMessage,
    chat: ChatMessage,
}

#[derive(Default)]
struct ChannelCache {
    entries: VecDeque<CachedEntry>,
}

impl ChannelCache {
    fn push(&mut self, trend: TrendMessage, chat: ChatMessage) {
        self.entries.push_back(CachedEntry {
            at: Instant::now(),
            trend,
            chat,
        });
        while self.entries.len() > CACHE_MAX_ENTRIES {
            self.entries.pop_front();
        }
        while self
            .entries
            .front()
            .map(|e| e.at.elapsed() > CACHE_MAX_AGE)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
    }
}

pub struct SessionEngine {
    config: AppConfig,
    timezone: Tz,
    collector: Collector,
    graph: AgentGraph,
    gateway: Arc<RoleGateway>,
    scheduler: Option<ReminderScheduler>,
    trend: Option<(Arc<TrendEngine>, Arc<dyn TrendSink>)>,
    cache: Mutex<HashMap<String, ChannelCache>>,
}

impl SessionEngine {
    pub fn new(
        config: AppConfig,
        gateway: Arc<RoleGateway>,
        registry: Arc<ToolRegistry>,
        personas: Arc<PersonaStore>,
        emoji: Arc<EmojiRegistry>,
        scheduler: Option<ReminderScheduler>,
        trend: Option<(Arc<TrendEngine>, Arc<dyn TrendSink>)>,
    ) -> Result<Self, CoreError> {
        let timezone: Tz = config
            .system
            .timezone
            .parse()
            .map_err(|_| CoreError::ConfigInvalid(format!("unknown timezone: {}", config.system.timezone)))?;

        let collector = Collector::new(config.discord.limits.clone(), config.discord.input_media.clone());
        let graph = AgentGraph::new(
            Arc::clone(&gateway),
            registry,
            personas,
            emoji,
            BehaviorSettings::from(&config.agent.behavior),
            StreamSettings::from(&config.streaming),
        );

        Ok(Self {
            config,
            timezone,
            collector,
            graph,
            gateway,
            scheduler,
            trend,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn scheduler(&self) -> Option<&ReminderScheduler> {
        self.scheduler.as_ref()
    }

    /// Feed a message the engine will not answer (other bots, own replies)
    /// into the channel cache so trend detection sees the full stream.
    pub fn observe_message(
        &self,
        channel_ref: &str,
        author_ref: &str,
        author_is_bot: bool,
        content: TrendContent,
        context_text: Option<String>,
    ) {
        let text = match &content {
            TrendContent::Text(text) => text.clone(),
            TrendContent::Sticker(id) => format!("[sticker {id}]"),
        };
        let chat = ChatMessage {
            role: if author_is_bot { Role::Assistant } else { Role::User },
            content: murmur_schema::Content::Text(text),
            metadata: murmur_schema::MessageMeta {
                origin_id: None,
                timestamp: Some(Utc::now()),
            },
        };
        let trend = TrendMessage {
            channel_ref: channel_ref.into(),
            author_ref: author_ref.into(),
            author_is_bot,
            content,
            context_text,
        };
        self.remember(channel_ref, trend, chat);
    }

    /// Offer a reaction event to the trend engine.
    pub async fn observe_reaction(&self, event: crate::trend::ReactionEvent) -> bool {
        match &self.trend {
            Some((engine, sink)) => engine.handle_reaction(&event, sink).await,
            None => false,
        }
    }

    /// Handle one user request end to end.
    pub async fn handle(
        &self,
        inbound: InboundMessage,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancelToken,
    ) -> SessionOutcome {
        let (trend_history, chat_history) = self.channel_history(&inbound.channel_ref);

        let current_trend = TrendMessage {
            channel_ref: inbound.channel_ref.clone(),
            author_ref: inbound.user_ref.clone(),
            author_is_bot: inbound.author_is_bot,
            content: TrendContent::Text(inbound.text.clone()),
            context_text: Some(format!("{}: {}", inbound.user_ref, inbound.text)),
        };
        let current_chat = ChatMessage {
            role: Role::User,
            content: murmur_schema::Content::Text(inbound.text.clone()),
            metadata: murmur_schema::MessageMeta {
                origin_id: inbound.origin_id.clone(),
                timestamp: inbound.timestamp,
            },
        };
        self.remember(&inbound.channel_ref, current_trend.clone(), current_chat);

        if inbound.author_is_bot {
            return SessionOutcome::Refused {
                reason: "bot messages are not answered".into(),
                notify_user: false,
            };
        }
        if let Some(reason) = self.permission_refusal(&inbound) {
            tracing::info!(user = %inbound.user_ref, channel = %inbound.channel_ref, "request refused: {reason}");
            return SessionOutcome::Refused {
                reason,
                notify_user: true,
            };
        }

        if let Some((engine, sink)) = &self.trend {
            if engine
                .handle_message(
                    &current_trend,
                    &trend_history,
                    inbound.guild_ref.as_deref(),
                    sink,
                )
                .await
            {
                tracing::debug!(channel = %inbound.channel_ref, "trend engine claimed the message");
                return SessionOutcome::ClaimedByTrend;
            }
        }

        let mut bus = ProgressBus::new(
            self.config.progress.discord.auto_generate_messages,
            Some(Arc::clone(&self.gateway)),
            self.config.progress.discord.messages.clone().into_iter().collect(),
        );
        bus.register(observer, self.observer_settings());

        let collected = self.collector.collect(CollectRequest {
            text: inbound.text.clone(),
            attachments: inbound.attachments.clone(),
            origin_id: inbound.origin_id.clone(),
            timestamp: inbound.timestamp,
            history: chat_history,
            history_limit: Some(self.config.discord.limits.max_messages),
        });
        let (messages, summary) = match collected {
            Ok(result) => result,
            Err(e) => return self.fail(bus, e).await,
        };
        tracing::debug!(
            messages = summary.message_count,
            dropped = summary.dropped_messages,
            "conversation collected"
        );

        let metadata = match &inbound.guild_ref {
            Some(guild) => format!(
                "channel={}; guild={}; user={}",
                inbound.channel_ref, guild, inbound.user_ref
            ),
            None => format!("channel={}; user={}", inbound.channel_ref, inbound.user_ref),
        };
        let state = GraphState::new(messages, metadata);
        let ctx = ToolContext::new(&inbound.channel_ref, &inbound.user_ref, self.timezone)
            .with_guild(inbound.guild_ref.clone());

        match self.graph.run(state, &bus, &ctx, &cancel).await {
            Ok(outcome) => {
                let (reminder_ids, warnings) = self.schedule_reminders(&outcome.reminders).await;
                self.observe_message(
                    &inbound.channel_ref,
                    "murmur",
                    true,
                    TrendContent::Text(outcome.final_answer.clone()),
                    None,
                );
                bus.close().await;
                SessionOutcome::Replied {
                    final_answer: outcome.final_answer,
                    sources: outcome.sources,
                    reminder_ids,
                    warnings,
                }
            }
            Err(e) => self.fail(bus, e).await,
        }
    }

    /// Re-enter the graph for a fired reminder. The synthesized prompt keeps
    /// the original content; delivery goes to the reminder's channel.
    pub async fn handle_reminder_fire(
        &self,
        details: &ReminderDetails,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancelToken,
    ) -> SessionOutcome {
        let mut inbound = InboundMessage::text_only(
            &details.channel_ref,
            &details.user_ref,
            &reminder_prompt(details),
        );
        inbound.timestamp = Some(Utc::now());
        self.handle(inbound, observer, cancel).await
    }

    async fn fail(&self, bus: ProgressBus, error: CoreError) -> SessionOutcome {
        let code = error.code();
        tracing::error!(code, "invocation failed: {error}");
        bus.emit_stage(ProgressStage::Error, None).await;
        bus.fail(error);
        bus.close().await;
        SessionOutcome::Failed {
            apology: apology_for(code).into(),
            code,
        }
    }

    async fn schedule_reminders(
        &self,
        reminders: &[ReminderDetails],
    ) -> (Vec<String>, Vec<String>) {
        let mut ids = Vec::new();
        let mut warnings = Vec::new();
        if reminders.is_empty() {
            return (ids, warnings);
        }
        let Some(scheduler) = &self.scheduler else {
            warnings.push("提醒功能目前未啟用，無法儲存這個提醒。".into());
            return (ids, warnings);
        };
        for details in reminders {
            match scheduler.schedule(details.clone()).await {
                Ok(id) => ids.push(id),
                Err(ScheduleError::QuotaExceeded { limit, .. }) => {
                    warnings.push(format!("你的提醒數量已達上限（{limit} 個），請先刪除一些。"));
                }
                Err(e) => {
                    tracing::error!("failed to persist reminder: {e}");
                    warnings.push("提醒儲存失敗，請稍後再試。".into());
                }
            }
        }
        (ids, warnings)
    }

    fn observer_settings(&self) -> ObserverSettings {
        let interval = self.config.progress.discord.update_interval.max(0.0);
        ObserverSettings {
            min_chunk_interval: Duration::from_millis((interval * 1000.0) as u64),
            ..ObserverSettings::default()
        }
    }

    fn permission_refusal(&self, inbound: &InboundMessage) -> Option<String> {
        let perms = &self.config.discord.permissions;
        if self.config.discord.maintenance.enabled {
            return Some(self.config.discord.maintenance.message.clone());
        }
        if inbound.is_dm && !perms.allow_dms {
            return Some("目前不接受私訊喔。".into());
        }
        if perms.users.blocked_ids.contains(&inbound.user_ref) {
            return Some("你沒有使用這個功能的權限。".into());
        }
        if !perms.users.allowed_ids.is_empty() && !perms.users.allowed_ids.contains(&inbound.user_ref)
        {
            return Some("你沒有使用這個功能的權限。".into());
        }
        if inbound
            .role_refs
            .iter()
            .any(|role| perms.roles.blocked_ids.contains(role))
        {
            return Some("你的身分組沒有使用權限。".into());
        }
        if !perms.roles.allowed_ids.is_empty()
            && !inbound
                .role_refs
                .iter()
                .any(|role| perms.roles.allowed_ids.contains(role))
        {
            return Some("你的身分組沒有使用權限。".into());
        }
        if perms.channels.blocked_ids.contains(&inbound.channel_ref) {
            return Some("這個頻道不開放使用。".into());
        }
        if !perms.channels.allowed_ids.is_empty()
            && !perms.channels.allowed_ids.contains(&inbound.channel_ref)
        {
            return Some("這個頻道不開放使用。".into());
        }
        None
    }

    fn remember(&self, channel_ref: &str, trend: TrendMessage, chat: ChatMessage) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(channel_ref.to_string())
            .or_default()
            .push(trend, chat);
    }

    fn channel_history(&self, channel_ref: &str) -> (Vec<TrendMessage>, Vec<ChatMessage>) {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(channel_ref) {
            Some(channel) => (
                channel.entries.iter().map(|e| e.trend.clone()).collect(),
                channel.entries.iter().map(|e| e.chat.clone()).collect(),
            ),
            None => (Vec::new(), Vec::new()),
        }
    }
}

pub fn reminder_prompt(details: &ReminderDetails) -> String {
    format!("（提醒時間到了）請提醒使用者：{}", details.content)
}

fn apology_for(code: &str) -> &'static str {
    match code {
        "input_too_large" => "訊息太長了，請縮短一點再試一次 😅",
        "rate_limited" => "現在請求有點多，稍等一下再試試看～",
        "cancelled" => "這次請求已經取消了。",
        "quota_exceeded" => "提醒數量已達上限，請先刪掉一些舊的提醒。",
        _ => "抱歉，處理你的請求時發生錯誤 😅 請稍後再試。",
    }
}
