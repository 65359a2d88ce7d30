//! Channel-scoped trend following, independent of the main graph.
//!
//! Three modes: repeating a reaction once it is popular enough, echoing a
//! streak of identical messages, and joining an all-emoji streak with a
//! generated emoji. Every mode is gated by channel allow-list, per-channel
//! cooldown, a bot-participation guard and (optionally) a probabilistic
//! roll; emission is jittered and re-checked so two racing events cannot
//! both send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use murmur_config::TrendFollowingConfig;
use murmur_provider::RoleGateway;
use murmur_schema::CancelToken;
use rand::Rng;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;

use crate::emoji::EmojiRegistry;

const LOCK_WAIT: Duration = Duration::from_millis(100);
const REACTION_MIN_DELAY: Duration = Duration::from_millis(200);
const REACTION_MAX_DELAY: Duration = Duration::from_millis(1000);

const FALLBACK_EMOJIS: &[&str] = &[
    "😄", "👍", "❤️", "😊", "🎉", "😂", "🔥", "💯", "👌", "😍", "🤔", "😅", "🙌", "💪", "🚀", "✨",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrendContent {
    Text(String),
    Sticker(String),
}

#[derive(Debug, Clone)]
pub struct TrendMessage {
    pub channel_ref: String,
    pub author_ref: String,
    pub author_is_bot: bool,
    pub content: TrendContent,
    /// Display text used only for emoji-reply context.
    pub context_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub channel_ref: String,
    pub message_ref: String,
    pub emoji: String,
    pub count: u32,
    pub by_bot: bool,
    pub bot_already_reacted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrendAction {
    React {
        channel_ref: String,
        message_ref: String,
        emoji: String,
    },
    Send {
        channel_ref: String,
        content: TrendContent,
    },
}

#[async_trait]
pub trait TrendSink: Send + Sync {
    async fn deliver(&self, action: TrendAction) -> anyhow::Result<()>;
}

struct ChannelState {
    message_lock: AsyncMutex<()>,
    reaction_lock: AsyncMutex<()>,
    last_fire: Mutex<Option<Instant>>,
    pending_message: Mutex<HashSet<&'static str>>,
    pending_reaction: AtomicBool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            message_lock: AsyncMutex::new(()),
            reaction_lock: AsyncMutex::new(()),
            last_fire: Mutex::new(None),
            pending_message: Mutex::new(HashSet::new()),
            pending_reaction: AtomicBool::new(false),
        }
    }
}

pub struct TrendEngine {
    config: TrendFollowingConfig,
    gateway: Option<Arc<RoleGateway>>,
    emoji: Arc<EmojiRegistry>,
    channels: Mutex<HashMap<String, Arc<ChannelState>>>,
    custom_emoji: Regex,
    unicode_emoji: Regex,
}

impl TrendEngine {
    pub fn new(
        config: TrendFollowingConfig,
        gateway: Option<Arc<RoleGateway>>,
        emoji: Arc<EmojiRegistry>,
    ) -> Self {
        Self {
            config,
            gateway,
            emoji,
            channels: Mutex::new(HashMap::new()),
            custom_emoji: Regex::new(r"<a?:[^:>\s]+:\d+>").unwrap(),
            unicode_emoji: Regex::new(concat!(
                "[",
                "\u{1F1E6}-\u{1F1FF}",
                "\u{1F300}-\u{1F5FF}",
                "\u{1F600}-\u{1F64F}",
                "\u{1F680}-\u{1F6FF}",
                "\u{1F700}-\u{1F77F}",
                "\u{1F780}-\u{1F7FF}",
                "\u{1F800}-\u{1F8FF}",
                "\u{1F900}-\u{1F9FF}",
                "\u{1FA00}-\u{1FA6F}",
                "\u{1FA70}-\u{1FAFF}",
                "\u{2190}-\u{21FF}",
                "\u{2600}-\u{26FF}",
                "\u{2700}-\u{27BF}",
                "\u{FE0F}",
                "\u{200D}",
                "]+"
            ))
            .unwrap(),
        }
    }

    pub fn is_enabled_in(&self, channel_ref: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        // An empty allow-list allows every channel.
        self.config.allowed_channels.is_empty()
            || self
                .config
                .allowed_channels
                .iter()
                .any(|c| c == channel_ref)
    }

    fn channel_state(&self, channel_ref: &str) -> Arc<ChannelState> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(channels.entry(channel_ref.to_string()).or_default())
    }

    fn in_cooldown(&self, state: &ChannelState) -> bool {
        let last_fire = state.last_fire.lock().unwrap_or_else(|e| e.into_inner());
        last_fire
            .map(|at| at.elapsed() < Duration::from_secs(self.config.cooldown_seconds))
            .unwrap_or(false)
    }

    fn touch_cooldown(&self, state: &ChannelState) {
        *state.last_fire.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Gate probability once `count` reaches `threshold`:
    /// `min(max_p, base_p + (count - threshold) · boost)`.
    pub fn probability_for(config: &TrendFollowingConfig, count: u32, threshold: u32) -> Option<f64> {
        if count < threshold {
            return None;
        }
        let excess = (count - threshold) as f64;
        Some(
            (config.base_probability + excess * config.probability_boost_factor)
                .min(config.max_probability),
        )
    }

    fn should_follow(&self, count: u32, threshold: u32) -> bool {
        if !self.config.enable_probabilistic {
            return count >= threshold;
        }
        match Self::probability_for(&self.config, count, threshold) {
            None => false,
            Some(p) => {
                let roll: f64 = rand::thread_rng().gen();
                let follow = roll < p;
                tracing::debug!(count, threshold, probability = p, follow, "probabilistic gate");
                follow
            }
        }
    }

    /// Offer a non-bot message. Returns true when the engine claimed it and
    /// emitted (or decided then aborted during re-check) a follow action.
    pub async fn handle_message(
        &self,
        message: &TrendMessage,
        history: &[TrendMessage],
        guild: Option<&str>,
        sink: &Arc<dyn TrendSink>,
    ) -> bool {
        if !self.is_enabled_in(&message.channel_ref) || message.author_is_bot {
            return false;
        }
        let state = self.channel_state(&message.channel_ref);
        if self.in_cooldown(&state) {
            return false;
        }

        let Ok(_guard) = tokio::time::timeout(LOCK_WAIT, state.message_lock.lock()).await else {
            tracing::debug!(channel = %message.channel_ref, "message trend busy, skipping");
            return false;
        };
        {
            let pending = state
                .pending_message
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !pending.is_empty() {
                return false;
            }
        }

        // Content streaks outrank emoji streaks.
        let decision: Option<(&'static str, TrendAction)> = if let Some(action) =
            self.content_decision(message, history)
        {
            Some(("content", action))
        } else if let Some(action) = self.emoji_decision(message, history, guild).await {
            Some(("emoji", action))
        } else {
            None
        };

        let Some((kind, action)) = decision else {
            return false;
        };

        {
            state
                .pending_message
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(kind);
        }
        let fired = self.emit_after_delay(&state, action, sink, false).await;
        {
            state
                .pending_message
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(kind);
        }
        if fired {
            tracing::info!(channel = %message.channel_ref, kind, "followed the trend");
        }
        fired
    }

    /// Offer a reaction event. Independent of the message path; may fire
    /// concurrently with it.
    pub async fn handle_reaction(&self, event: &ReactionEvent, sink: &Arc<dyn TrendSink>) -> bool {
        if !self.is_enabled_in(&event.channel_ref) || event.by_bot || event.bot_already_reacted {
            return false;
        }
        let state = self.channel_state(&event.channel_ref);
        if self.in_cooldown(&state) {
            return false;
        }

        let Ok(_guard) = tokio::time::timeout(LOCK_WAIT, state.reaction_lock.lock()).await else {
            tracing::debug!(channel = %event.channel_ref, "reaction trend busy, skipping");
            return false;
        };
        if state.pending_reaction.load(Ordering::SeqCst) {
            return false;
        }
        if !self.should_follow(event.count, self.config.reaction_threshold) {
            return false;
        }

        state.pending_reaction.store(true, Ordering::SeqCst);
        let action = TrendAction::React {
            channel_ref: event.channel_ref.clone(),
            message_ref: event.message_ref.clone(),
            emoji: event.emoji.clone(),
        };
        let fired = self.emit_after_delay(&state, action, sink, true).await;
        state.pending_reaction.store(false, Ordering::SeqCst);
        if fired {
            tracing::info!(channel = %event.channel_ref, emoji = %event.emoji, "followed the reaction");
        }
        fired
    }

    /// Jittered emission with a cooldown re-check so a decision that waited
    /// into another emission's window aborts cleanly.
    async fn emit_after_delay(
        &self,
        state: &ChannelState,
        action: TrendAction,
        sink: &Arc<dyn TrendSink>,
        short_delay: bool,
    ) -> bool {
        if self.config.enable_random_delay {
            let delay = if short_delay {
                let cap = REACTION_MAX_DELAY.min(Duration::from_millis(self.config.max_delay_ms));
                random_delay(REACTION_MIN_DELAY.min(cap), cap)
            } else {
                random_delay(
                    Duration::from_millis(self.config.min_delay_ms),
                    Duration::from_millis(self.config.max_delay_ms),
                )
            };
            tokio::time::sleep(delay).await;
        }
        if self.in_cooldown(state) {
            tracing::debug!("another emission won during the delay, aborting");
            return false;
        }
        if let Err(e) = sink.deliver(action).await {
            tracing::warn!("trend delivery failed: {e:#}");
            return false;
        }
        self.touch_cooldown(state);
        true
    }

    fn content_decision(&self, message: &TrendMessage, history: &[TrendMessage]) -> Option<TrendAction> {
        let (streak, has_bot) = content_streak(history, &message.content);
        if has_bot {
            tracing::debug!("content trend blocked: already participated in this streak");
            return None;
        }
        let total = streak + 1;
        if self.should_follow(total, self.config.content_threshold) {
            Some(TrendAction::Send {
                channel_ref: message.channel_ref.clone(),
                content: message.content.clone(),
            })
        } else {
            None
        }
    }

    async fn emoji_decision(
        &self,
        message: &TrendMessage,
        history: &[TrendMessage],
        guild: Option<&str>,
    ) -> Option<TrendAction> {
        let TrendContent::Text(text) = &message.content else {
            return None;
        };
        if !self.is_emoji_only(text) {
            return None;
        }

        let (streak, has_bot) = self.emoji_streak(history);
        if has_bot {
            tracing::debug!("emoji trend blocked: already participated in this streak");
            return None;
        }
        let total = streak + 1;
        if !self.should_follow(total, self.config.emoji_threshold) {
            return None;
        }

        // Generate before the delay so the sleep stays the only wait.
        let reply = self.generate_emoji_reply(history, guild).await;
        Some(TrendAction::Send {
            channel_ref: message.channel_ref.clone(),
            content: TrendContent::Text(reply),
        })
    }

    /// A message is emoji-only when stripping custom tokens and Unicode
    /// emoji leaves nothing, and at least one emoji was present.
    pub fn is_emoji_only(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        let without_custom = self.custom_emoji.replace_all(trimmed, "");
        let without_any = self.unicode_emoji.replace_all(&without_custom, "");
        if !without_any.trim().is_empty() {
            return false;
        }
        self.custom_emoji.is_match(trimmed) || self.unicode_emoji.is_match(trimmed)
    }

    fn emoji_streak(&self, history: &[TrendMessage]) -> (u32, bool) {
        let mut streak = 0u32;
        let mut has_bot = false;
        for message in history.iter().rev() {
            match &message.content {
                TrendContent::Text(text) if self.is_emoji_only(text) => {
                    streak += 1;
                    if message.author_is_bot {
                        has_bot = true;
                    }
                }
                _ => break,
            }
        }
        (streak, has_bot)
    }

    async fn generate_emoji_reply(&self, history: &[TrendMessage], guild: Option<&str>) -> String {
        let fallback = || {
            FALLBACK_EMOJIS[rand::thread_rng().gen_range(0..FALLBACK_EMOJIS.len())].to_string()
        };
        let Some(gateway) = &self.gateway else {
            return fallback();
        };

        let context: Vec<String> = history
            .iter()
            .rev()
            .filter_map(|m| m.context_text.clone())
            .take(5)
            .collect();
        let emoji_context = self.emoji.prompt_context(guild);
        if context.is_empty() && emoji_context.is_empty() {
            return fallback();
        }

        let prompt = format!(
            "頻道裡大家正在用 emoji 洗版。最近的對話：\n{}\n\n\
             你可以使用這些自訂表情（完整格式）：\n{}\n\
             也可以用 Unicode emoji（😄👍❤️等）。\
             根據氣氛選一個最適合的 emoji 回應，只回傳那一個 emoji，不要其他文字。",
            context.into_iter().rev().collect::<Vec<_>>().join("\n"),
            emoji_context,
        );

        match gateway.blurb(prompt, &CancelToken::new()).await {
            Ok(reply) => {
                if let Some(m) = self.custom_emoji.find(&reply) {
                    return m.as_str().to_string();
                }
                if let Some(m) = self.unicode_emoji.find(&reply) {
                    return m.as_str().to_string();
                }
                fallback()
            }
            Err(e) => {
                tracing::debug!("emoji reply generation failed, using fallback: {e}");
                fallback()
            }
        }
    }
}

/// Consecutive same-content run at the tail of `history`, plus whether the
/// bot already took part in it.
fn content_streak(history: &[TrendMessage], target: &TrendContent) -> (u32, bool) {
    let mut streak = 0u32;
    let mut has_bot = false;
    for message in history.iter().rev() {
        if &message.content == target {
            streak += 1;
            if message.author_is_bot {
                has_bot = true;
            }
        } else {
            break;
        }
    }
    (streak, has_bot)
}

fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        actions: Mutex<Vec<TrendAction>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                actions: Mutex::new(Vec::new()),
            })
        }

        fn actions(&self) -> Vec<TrendAction> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrendSink for RecordingSink {
        async fn deliver(&self, action: TrendAction) -> anyhow::Result<()> {
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn config() -> TrendFollowingConfig {
        TrendFollowingConfig {
            enabled: true,
            allowed_channels: vec![],
            cooldown_seconds: 60,
            reaction_threshold: 3,
            content_threshold: 2,
            emoji_threshold: 2,
            message_history_limit: 10,
            enable_probabilistic: false,
            base_probability: 0.5,
            probability_boost_factor: 0.15,
            max_probability: 0.95,
            enable_random_delay: false,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn engine(config: TrendFollowingConfig) -> TrendEngine {
        TrendEngine::new(config, None, Arc::new(EmojiRegistry::default()))
    }

    fn text_message(channel: &str, author: &str, is_bot: bool, text: &str) -> TrendMessage {
        TrendMessage {
            channel_ref: channel.into(),
            author_ref: author.into(),
            author_is_bot: is_bot,
            content: TrendContent::Text(text.into()),
            context_text: Some(format!("{author}: {text}")),
        }
    }

    #[test]
    fn probability_curve_matches_expectations() {
        let config = config();
        assert!(TrendEngine::probability_for(&config, 1, 2).is_none());
        let p2 = TrendEngine::probability_for(&config, 2, 2).unwrap();
        assert!((p2 - 0.5).abs() < 1e-9);
        let p4 = TrendEngine::probability_for(&config, 4, 2).unwrap();
        assert!((p4 - 0.80).abs() < 1e-9);
        let p9 = TrendEngine::probability_for(&config, 9, 2).unwrap();
        assert!((p9 - 0.95).abs() < 1e-9);
    }

    #[test]
    fn allow_list_gating() {
        let mut cfg = config();
        cfg.allowed_channels = vec!["chan-a".into()];
        let eng = engine(cfg);
        assert!(eng.is_enabled_in("chan-a"));
        assert!(!eng.is_enabled_in("chan-b"));

        let open = engine(config());
        assert!(open.is_enabled_in("anything"));
    }

    #[test]
    fn emoji_only_detection() {
        let engine = engine(config());
        assert!(engine.is_emoji_only("😄😄"));
        assert!(engine.is_emoji_only("<:wave:12345>"));
        assert!(engine.is_emoji_only("<a:party:9> 🎉"));
        assert!(engine.is_emoji_only("❤️"));
        assert!(!engine.is_emoji_only("hello 😄"));
        assert!(!engine.is_emoji_only("plain"));
        assert!(!engine.is_emoji_only("  "));
    }

    #[test]
    fn content_streak_counts_tail_and_flags_bot() {
        let target = TrendContent::Text("哈哈".into());
        let history = vec![
            text_message("c", "u1", false, "別的"),
            text_message("c", "u2", false, "哈哈"),
            text_message("c", "bot", true, "哈哈"),
        ];
        let (streak, has_bot) = content_streak(&history, &target);
        assert_eq!(streak, 2);
        assert!(has_bot);

        let clean = vec![
            text_message("c", "u1", false, "哈哈"),
            text_message("c", "u2", false, "哈哈"),
        ];
        let (streak, has_bot) = content_streak(&clean, &target);
        assert_eq!(streak, 2);
        assert!(!has_bot);
    }

    #[tokio::test]
    async fn content_trend_fires_and_echoes() {
        let engine = engine(config());
        let sink = RecordingSink::new();
        let history = vec![text_message("c", "u1", false, "蓋大樓")];
        let current = text_message("c", "u2", false, "蓋大樓");

        let fired = engine
            .handle_message(&current, &history, None, &(sink.clone() as Arc<dyn TrendSink>))
            .await;
        assert!(fired);
        assert_eq!(
            sink.actions(),
            vec![TrendAction::Send {
                channel_ref: "c".into(),
                content: TrendContent::Text("蓋大樓".into()),
            }]
        );
    }

    #[tokio::test]
    async fn bot_participation_suppresses_follow() {
        let engine = engine(config());
        let sink = RecordingSink::new();
        let history = vec![
            text_message("c", "u1", false, "蓋大樓"),
            text_message("c", "bot", true, "蓋大樓"),
        ];
        let current = text_message("c", "u2", false, "蓋大樓");

        let fired = engine
            .handle_message(&current, &history, None, &(sink.clone() as Arc<dyn TrendSink>))
            .await;
        assert!(!fired);
        assert!(sink.actions().is_empty());
    }

    #[tokio::test]
    async fn cooldown_limits_to_one_emission_per_window() {
        let engine = engine(config());
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();
        let history = vec![text_message("c", "u1", false, "+1")];

        let first = engine
            .handle_message(&text_message("c", "u2", false, "+1"), &history, None, &sink)
            .await;
        let second = engine
            .handle_message(&text_message("c", "u3", false, "+1"), &history, None, &sink)
            .await;
        assert!(first);
        assert!(!second);
        assert_eq!(recorder.actions().len(), 1);
    }

    #[tokio::test]
    async fn emoji_trend_uses_fallback_without_model() {
        let engine = engine(config());
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();
        let history = vec![text_message("c", "u1", false, "😄😄")];

        let fired = engine
            .handle_message(&text_message("c", "u2", false, "🎉"), &history, None, &sink)
            .await;
        assert!(fired);
        let actions = recorder.actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            TrendAction::Send {
                content: TrendContent::Text(emoji),
                ..
            } => assert!(FALLBACK_EMOJIS.contains(&emoji.as_str())),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn content_outranks_emoji_when_both_qualify() {
        // Identical emoji messages satisfy both modes; the echo (content)
        // path must win, so the sent content equals the incoming text.
        let engine = engine(config());
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();
        let history = vec![text_message("c", "u1", false, "😄")];

        let fired = engine
            .handle_message(&text_message("c", "u2", false, "😄"), &history, None, &sink)
            .await;
        assert!(fired);
        assert_eq!(
            recorder.actions(),
            vec![TrendAction::Send {
                channel_ref: "c".into(),
                content: TrendContent::Text("😄".into()),
            }]
        );
    }

    #[tokio::test]
    async fn reaction_trend_requires_threshold_and_no_prior_bot_reaction() {
        let mut cfg = config();
        cfg.reaction_threshold = 3;
        let engine = engine(cfg);
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();

        let mut event = ReactionEvent {
            channel_ref: "c".into(),
            message_ref: "m1".into(),
            emoji: "👍".into(),
            count: 2,
            by_bot: false,
            bot_already_reacted: false,
        };
        assert!(!engine.handle_reaction(&event, &sink).await);

        event.count = 3;
        event.bot_already_reacted = true;
        assert!(!engine.handle_reaction(&event, &sink).await);

        event.bot_already_reacted = false;
        assert!(engine.handle_reaction(&event, &sink).await);
        assert_eq!(recorder.actions().len(), 1);
    }

    #[tokio::test]
    async fn sticker_streaks_compare_by_id() {
        let engine = engine(config());
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();
        let sticker = |id: &str, is_bot: bool| TrendMessage {
            channel_ref: "c".into(),
            author_ref: "u".into(),
            author_is_bot: is_bot,
            content: TrendContent::Sticker(id.into()),
            context_text: None,
        };

        let fired = engine
            .handle_message(&sticker("s9", false), &[sticker("s9", false)], None, &sink)
            .await;
        assert!(fired);
        assert_eq!(
            recorder.actions(),
            vec![TrendAction::Send {
                channel_ref: "c".into(),
                content: TrendContent::Sticker("s9".into()),
            }]
        );
    }

    #[tokio::test]
    async fn disabled_engine_claims_nothing() {
        let mut cfg = config();
        cfg.enabled = false;
        let engine = engine(cfg);
        let recorder = RecordingSink::new();
        let sink: Arc<dyn TrendSink> = recorder.clone();
        let fired = engine
            .handle_message(
                &text_message("c", "u", false, "x"),
                &[text_message("c", "u0", false, "x")],
                None,
                &sink,
            )
            .await;
        assert!(!fired);
    }

    #[test]
    fn hard_threshold_mode_ignores_probability() {
        let mut cfg = config();
        cfg.enable_probabilistic = false;
        let engine = engine(cfg);
        assert!(engine.should_follow(2, 2));
        assert!(!engine.should_follow(1, 2));
    }
}
