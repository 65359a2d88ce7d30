//! Shared bootstrap for the service and tester binaries.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use murmur_config::{load_config, AppConfig};
use murmur_core::emoji::EmojiRegistry;
use murmur_core::persona::PersonaStore;
use murmur_core::progress::ProgressObserver;
use murmur_core::session::SessionEngine;
use murmur_core::tool::ToolRegistry;
use murmur_core::tools::{ReminderTool, VideoSummaryTool, WebSearchTool};
use murmur_core::trend::{TrendAction, TrendContent, TrendEngine, TrendSink};
use murmur_provider::{
    GatewaySettings, GeminiProvider, LlmProvider, RoleGateway, RoleSettings, StubProvider,
};
use murmur_scheduler::{ReminderFire, ReminderScheduler, ReminderStore, SchedulerConfig};
use murmur_schema::{CoreError, ProgressEvent, Source, StreamingChunk};
use tokio::sync::mpsc;

pub struct Runtime {
    pub config: AppConfig,
    pub engine: Arc<SessionEngine>,
    pub scheduler: Option<ReminderScheduler>,
    pub fire_rx: Option<mpsc::Receiver<ReminderFire>>,
}

/// Load and validate the config file. Failures here are exit-code-1 errors.
pub fn load(config_path: &Path) -> Result<AppConfig> {
    load_config(config_path)
}

/// Stderr + daily-rolling file logging. Keep the guard alive for the
/// process lifetime.
pub fn init_tracing(config: &AppConfig, log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "murmur.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.system.log_level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

fn role_settings(config: &murmur_config::ModelRoleConfig) -> RoleSettings {
    RoleSettings {
        model: config.model.clone(),
        temperature: config.temperature,
        max_output_tokens: config.max_output_tokens,
    }
}

/// Wire the whole engine from a validated config. The config directory
/// anchors relative paths (personas, emoji file, reminder store).
pub fn build_runtime(config: AppConfig, config_dir: &Path) -> Result<Runtime> {
    let api_key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
    let provider: Arc<dyn LlmProvider> = match config.llm.provider.as_str() {
        "gemini" => Arc::new(GeminiProvider::new(api_key.clone())),
        _ => Arc::new(StubProvider),
    };

    let gateway = Arc::new(RoleGateway::new(
        provider,
        GatewaySettings {
            planner: role_settings(&config.llm.models.planner),
            finalizer: role_settings(&config.llm.models.finalizer),
            reflector: role_settings(&config.llm.models.reflector),
            blurb: role_settings(&config.llm.models.progress_blurb),
            retry_attempts: config.llm.retry_attempts,
        },
    ));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(WebSearchTool::new(
        api_key.clone(),
        config.llm.models.planner.model.clone(),
        config.is_tool_enabled("web_search"),
        config.tool_priority("web_search"),
    )));
    registry.register(Arc::new(VideoSummaryTool::new(
        api_key,
        config.llm.models.planner.model.clone(),
        config.is_tool_enabled("video_summary"),
        config.tool_priority("video_summary"),
    )));
    registry.register(Arc::new(ReminderTool::new(
        config.is_tool_enabled("set_reminder"),
        config.tool_priority("set_reminder"),
    )));

    let persona_dir = resolve_path(config_dir, &config.prompt_system.persona.persona_directory);
    let personas = Arc::new(PersonaStore::load(&persona_dir, &config.prompt_system.persona));
    if personas.is_empty() && config.prompt_system.persona.enabled {
        tracing::warn!(
            "no personas found under {}, replies will use the builtin default tone",
            persona_dir.display()
        );
    }

    let emoji = Arc::new(match &config.emoji.config_file {
        Some(file) => {
            let path = resolve_path(config_dir, file);
            EmojiRegistry::load_yaml(&path)
                .with_context(|| format!("failed to load emoji registry {}", path.display()))?
        }
        None => EmojiRegistry::default(),
    });

    let (scheduler, fire_rx) = if config.reminder.enabled {
        let store_path = resolve_path(config_dir, &config.reminder.persistence_file);
        let store = ReminderStore::new(store_path);
        let (scheduler, fire_rx) = ReminderScheduler::new(
            SchedulerConfig {
                max_reminders_per_user: config.reminder.max_reminders_per_user,
                startup_grace: std::time::Duration::from_secs(config.reminder.startup_grace_seconds),
                max_fire_attempts: config.reminder.max_fire_attempts,
                cleanup_terminal_events: config.reminder.cleanup_expired_events,
            },
            store,
        )?;
        (Some(scheduler), Some(fire_rx))
    } else {
        (None, None)
    };

    let trend = if config.trend_following.enabled {
        let engine = Arc::new(TrendEngine::new(
            config.trend_following.clone(),
            Some(Arc::clone(&gateway)),
            Arc::clone(&emoji),
        ));
        let sink: Arc<dyn TrendSink> = Arc::new(ConsoleTrendSink);
        Some((engine, sink))
    } else {
        None
    };

    let engine = Arc::new(
        SessionEngine::new(
            config.clone(),
            gateway,
            Arc::new(registry),
            personas,
            emoji,
            scheduler.clone(),
            trend,
        )
        .map_err(|e| anyhow::anyhow!(e))?,
    );

    Ok(Runtime {
        config,
        engine,
        scheduler,
        fire_rx,
    })
}

fn resolve_path(config_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        config_dir.join(path)
    }
}

/// Trend actions just print on the console transport.
pub struct ConsoleTrendSink;

#[async_trait]
impl TrendSink for ConsoleTrendSink {
    async fn deliver(&self, action: TrendAction) -> Result<()> {
        match action {
            TrendAction::React {
                channel_ref, emoji, ..
            } => println!("[{channel_ref}] (跟風 reaction) {emoji}"),
            TrendAction::Send {
                channel_ref,
                content,
            } => match content {
                TrendContent::Text(text) => println!("[{channel_ref}] (跟風) {text}"),
                TrendContent::Sticker(id) => println!("[{channel_ref}] (跟風貼圖) {id}"),
            },
        }
        Ok(())
    }
}

/// Progress observer for the terminal, honoring the `progress.cli` knobs.
pub struct ConsoleObserver {
    pub show_progress: bool,
    pub show_percentage: bool,
    pub show_eta: bool,
    streamed: std::sync::atomic::AtomicBool,
}

impl ConsoleObserver {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            show_progress: config.progress.cli.enabled,
            show_percentage: config.progress.cli.show_percentage,
            show_eta: config.progress.cli.show_eta,
            streamed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Quiet variant: final output only.
    pub fn quiet() -> Self {
        Self {
            show_progress: false,
            show_percentage: false,
            show_eta: false,
            streamed: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProgressObserver for ConsoleObserver {
    async fn on_progress(&self, event: ProgressEvent) {
        if !self.show_progress {
            return;
        }
        let mut line = format!("⏳ {}", event.message);
        if self.show_percentage {
            if let Some(pct) = event.progress_pct {
                line.push_str(&format!(" ({pct}%)"));
            }
        }
        if self.show_eta {
            if let Some(eta) = event.eta_seconds {
                line.push_str(&format!(" 約剩 {eta}s"));
            }
        }
        eprintln!("{line}");
    }

    async fn on_streaming_chunk(&self, chunk: StreamingChunk) {
        self.streamed.store(true, std::sync::atomic::Ordering::SeqCst);
        print!("{}", chunk.content);
        let _ = std::io::stdout().flush();
    }

    async fn on_streaming_complete(&self) {
        println!();
    }

    async fn on_completion(&self, final_text: String, sources: Vec<Source>) {
        // Streaming already printed the text; whole replies print here.
        if !final_text.is_empty() && !self.streamed.load(std::sync::atomic::Ordering::SeqCst) {
            println!("{final_text}");
        }
        if !sources.is_empty() {
            println!("📚 參考來源:");
            for (i, source) in sources.iter().enumerate() {
                println!("  {}. {} - {}", i + 1, source.title, source.url);
            }
        }
    }

    async fn on_error(&self, error: CoreError) {
        eprintln!("❌ {error}");
    }
}
