//! Strongly-typed configuration surface.
//!
//! Every section rejects unknown keys; missing values fall back to the
//! documented defaults. Secrets never live in the file; the model API key
//! comes from the environment variable named in `llm.api_key_env`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use murmur_schema::CoreError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_timezone() -> String {
    "Asia/Taipei".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordLimitsConfig {
    #[serde(default = "default_max_text")]
    pub max_text: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_text() -> usize {
    100_000
}

fn default_max_images() -> usize {
    3
}

fn default_max_messages() -> usize {
    25
}

impl Default for DiscordLimitsConfig {
    fn default() -> Self {
        Self {
            max_text: default_max_text(),
            max_images: default_max_images(),
            max_messages: default_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputMediaConfig {
    /// Animated attachments are sub-sampled to at most this many frames.
    #[serde(default = "default_max_frames")]
    pub max_animation_frames: usize,
}

fn default_max_frames() -> usize {
    4
}

impl Default for InputMediaConfig {
    fn default() -> Self {
        Self {
            max_animation_frames: default_max_frames(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdListConfig {
    #[serde(default)]
    pub allowed_ids: Vec<String>,
    #[serde(default)]
    pub blocked_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordPermissionsConfig {
    #[serde(default)]
    pub allow_dms: bool,
    #[serde(default)]
    pub users: IdListConfig,
    #[serde(default)]
    pub roles: IdListConfig,
    #[serde(default)]
    pub channels: IdListConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_maintenance_message")]
    pub message: String,
}

fn default_maintenance_message() -> String {
    "維護中，稍後再試～".to_string()
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            message: default_maintenance_message(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    #[serde(default)]
    pub limits: DiscordLimitsConfig,
    #[serde(default)]
    pub input_media: InputMediaConfig,
    #[serde(default)]
    pub permissions: DiscordPermissionsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRoleConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmModelsConfig {
    pub planner: ModelRoleConfig,
    pub finalizer: ModelRoleConfig,
    pub reflector: ModelRoleConfig,
    pub progress_blurb: ModelRoleConfig,
}

impl Default for LlmModelsConfig {
    fn default() -> Self {
        let role = |temperature: f32, max_output_tokens: u32| ModelRoleConfig {
            model: "gemini-2.0-flash-exp".to_string(),
            temperature,
            max_output_tokens,
        };
        Self {
            planner: role(0.1, 8192),
            finalizer: role(0.7, 8192),
            reflector: role(0.3, 1024),
            progress_blurb: role(0.9, 20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// "gemini" in production; "stub" keeps the tester usable offline.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub models: LlmModelsConfig,
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key_env: default_api_key_env(),
            retry_attempts: default_retry_attempts(),
            models: LlmModelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tool_priority")]
    pub priority: i32,
}

fn default_tool_priority() -> i32 {
    999
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentBehaviorConfig {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Wallclock budget for one execute round, in seconds.
    #[serde(default = "default_timeout_per_round")]
    pub timeout_per_round: u64,
    #[serde(default = "default_true")]
    pub enable_reflection: bool,
}

fn default_max_tool_rounds() -> u32 {
    1
}

fn default_timeout_per_round() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for AgentBehaviorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            timeout_per_round: default_timeout_per_round(),
            enable_reflection: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub behavior: AgentBehaviorConfig,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Expected answers shorter than this are sent whole.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    /// Overall timeout for the streaming finalizer call, in seconds.
    #[serde(default = "default_stream_timeout")]
    pub timeout_seconds: u64,
}

fn default_min_content_length() -> usize {
    200
}

fn default_stream_timeout() -> u64 {
    300
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_content_length: default_min_content_length(),
            timeout_seconds: default_stream_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressDiscordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_embeds: bool,
    /// Minimum seconds between streamed edits per observer.
    #[serde(default = "default_update_interval")]
    pub update_interval: f64,
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay: u64,
    #[serde(default)]
    pub auto_generate_messages: bool,
    /// Static per-stage templates used when auto-generation is off or fails.
    #[serde(default)]
    pub messages: BTreeMap<String, String>,
}

fn default_update_interval() -> f64 {
    0.5
}

fn default_cleanup_delay() -> u64 {
    30
}

impl Default for ProgressDiscordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_embeds: true,
            update_interval: default_update_interval(),
            cleanup_delay: default_cleanup_delay(),
            auto_generate_messages: false,
            messages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressCliConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub show_percentage: bool,
    #[serde(default = "default_true")]
    pub show_eta: bool,
}

impl Default for ProgressCliConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_percentage: true,
            show_eta: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressConfig {
    #[serde(default)]
    pub discord: ProgressDiscordConfig,
    #[serde(default)]
    pub cli: ProgressCliConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReminderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_persistence_file")]
    pub persistence_file: String,
    #[serde(default = "default_max_reminders")]
    pub max_reminders_per_user: usize,
    #[serde(default = "default_true")]
    pub cleanup_expired_events: bool,
    /// Events already overdue by more than this at startup are dropped.
    #[serde(default)]
    pub startup_grace_seconds: u64,
    #[serde(default = "default_fire_attempts")]
    pub max_fire_attempts: u32,
}

fn default_persistence_file() -> String {
    "data/events.json".to_string()
}

fn default_max_reminders() -> usize {
    5
}

fn default_fire_attempts() -> u32 {
    3
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persistence_file: default_persistence_file(),
            max_reminders_per_user: default_max_reminders(),
            cleanup_expired_events: true,
            startup_grace_seconds: 0,
            max_fire_attempts: default_fire_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrendFollowingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Empty list allows every channel.
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_reaction_threshold")]
    pub reaction_threshold: u32,
    #[serde(default = "default_content_threshold")]
    pub content_threshold: u32,
    #[serde(default = "default_emoji_threshold")]
    pub emoji_threshold: u32,
    #[serde(default = "default_history_limit")]
    pub message_history_limit: usize,
    #[serde(default = "default_true")]
    pub enable_probabilistic: bool,
    #[serde(default = "default_base_probability")]
    pub base_probability: f64,
    #[serde(default = "default_boost_factor")]
    pub probability_boost_factor: f64,
    #[serde(default = "default_max_probability")]
    pub max_probability: f64,
    #[serde(default = "default_true")]
    pub enable_random_delay: bool,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_cooldown() -> u64 {
    60
}

fn default_reaction_threshold() -> u32 {
    3
}

fn default_content_threshold() -> u32 {
    3
}

fn default_emoji_threshold() -> u32 {
    3
}

fn default_history_limit() -> usize {
    10
}

fn default_base_probability() -> f64 {
    0.5
}

fn default_boost_factor() -> f64 {
    0.15
}

fn default_max_probability() -> f64 {
    0.95
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    3000
}

impl Default for TrendFollowingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_channels: Vec::new(),
            cooldown_seconds: default_cooldown(),
            reaction_threshold: default_reaction_threshold(),
            content_threshold: default_content_threshold(),
            emoji_threshold: default_emoji_threshold(),
            message_history_limit: default_history_limit(),
            enable_probabilistic: true,
            base_probability: default_base_probability(),
            probability_boost_factor: default_boost_factor(),
            max_probability: default_max_probability(),
            enable_random_delay: true,
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub random_selection: bool,
    #[serde(default = "default_persona")]
    pub default_persona: String,
    #[serde(default = "default_persona_directory")]
    pub persona_directory: String,
}

fn default_persona() -> String {
    "default".to_string()
}

fn default_persona_directory() -> String {
    "personas".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            random_selection: true,
            default_persona: default_persona(),
            persona_directory: default_persona_directory(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSystemConfig {
    #[serde(default)]
    pub persona: PersonaConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmojiConfigRef {
    /// Optional path to the emoji registry YAML.
    #[serde(default)]
    pub config_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub reminder: ReminderConfig,
    #[serde(default)]
    pub trend_following: TrendFollowingConfig,
    #[serde(default)]
    pub prompt_system: PromptSystemConfig,
    #[serde(default)]
    pub emoji: EmojiConfigRef,
}

impl AppConfig {
    pub fn is_tool_enabled(&self, name: &str) -> bool {
        self.agent
            .tools
            .get(name)
            .map(|t| t.enabled)
            .unwrap_or(false)
    }

    pub fn tool_priority(&self, name: &str) -> i32 {
        self.agent
            .tools
            .get(name)
            .map(|t| t.priority)
            .unwrap_or_else(default_tool_priority)
    }

    /// Enabled tool names in priority order (stable for equal priorities).
    pub fn enabled_tools(&self) -> Vec<String> {
        let mut tools: Vec<(&String, i32)> = self
            .agent
            .tools
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(name, cfg)| (name, cfg.priority))
            .collect();
        tools.sort_by_key(|(_, priority)| *priority);
        tools.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Expand `${VAR}` placeholders from the process environment.
/// Unclosed braces pass through untouched; missing variables become empty.
pub fn resolve_env_var(raw: &str) -> String {
    let mut resolved = String::with_capacity(raw.len());
    let mut cursor = 0;

    while let Some(offset) = raw[cursor..].find("${") {
        let open = cursor + offset;
        let Some(close) = raw[open + 2..].find('}').map(|c| open + 2 + c) else {
            // No closing brace anywhere after this point.
            break;
        };
        resolved.push_str(&raw[cursor..open]);
        let var_name = &raw[open + 2..close];
        resolved.push_str(&std::env::var(var_name).unwrap_or_default());
        cursor = close + 1;
    }

    resolved.push_str(&raw[cursor..]);
    resolved
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: AppConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    config.reminder.persistence_file = resolve_env_var(&config.reminder.persistence_file);
    config.prompt_system.persona.persona_directory =
        resolve_env_var(&config.prompt_system.persona.persona_directory);
    if let Some(file) = &config.emoji.config_file {
        config.emoji.config_file = Some(resolve_env_var(file));
    }

    validate_config(&config).map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

/// Startup validation. An enabled feature with missing prerequisites is a
/// configuration error, not a runtime one.
pub fn validate_config(config: &AppConfig) -> Result<(), CoreError> {
    let invalid = |msg: String| Err(CoreError::ConfigInvalid(msg));

    if config.system.timezone.parse::<chrono_tz::Tz>().is_err() {
        return invalid(format!("unknown timezone: {}", config.system.timezone));
    }

    match config.llm.provider.as_str() {
        "gemini" => {
            let key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
            if key.is_empty() {
                return invalid(format!(
                    "llm.provider is gemini but {} is not set",
                    config.llm.api_key_env
                ));
            }
        }
        "stub" => {}
        other => return invalid(format!("unknown llm.provider: {other}")),
    }

    for (name, role) in [
        ("planner", &config.llm.models.planner),
        ("finalizer", &config.llm.models.finalizer),
        ("reflector", &config.llm.models.reflector),
        ("progress_blurb", &config.llm.models.progress_blurb),
    ] {
        if role.model.trim().is_empty() {
            return invalid(format!("llm.models.{name}.model must not be empty"));
        }
        if !(0.0..=2.0).contains(&role.temperature) {
            return invalid(format!(
                "llm.models.{name}.temperature must be within [0, 2]"
            ));
        }
    }

    if config.agent.behavior.timeout_per_round == 0 {
        return invalid("agent.behavior.timeout_per_round must be positive".into());
    }

    let known_tools: HashMap<&str, ()> =
        [("web_search", ()), ("video_summary", ()), ("set_reminder", ())]
            .into_iter()
            .collect();
    for name in config.agent.tools.keys() {
        if !known_tools.contains_key(name.as_str()) {
            return invalid(format!("agent.tools.{name} is not a known tool"));
        }
    }

    if config.reminder.enabled {
        if config.reminder.persistence_file.trim().is_empty() {
            return invalid("reminder.persistence_file must not be empty".into());
        }
        if config.reminder.max_fire_attempts == 0 {
            return invalid("reminder.max_fire_attempts must be at least 1".into());
        }
    }

    let trend = &config.trend_following;
    if trend.enabled {
        for (name, value) in [
            ("reaction_threshold", trend.reaction_threshold),
            ("content_threshold", trend.content_threshold),
            ("emoji_threshold", trend.emoji_threshold),
        ] {
            if value == 0 {
                return invalid(format!("trend_following.{name} must be at least 1"));
            }
        }
        for (name, value) in [
            ("base_probability", trend.base_probability),
            ("probability_boost_factor", trend.probability_boost_factor),
            ("max_probability", trend.max_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("trend_following.{name} must be within [0, 1]"));
            }
        }
        if trend.min_delay_ms > trend.max_delay_ms {
            return invalid("trend_following.min_delay_ms exceeds max_delay_ms".into());
        }
    }

    if config.progress.discord.update_interval < 0.0 {
        return invalid("progress.discord.update_interval must not be negative".into());
    }

    Ok(())
}
