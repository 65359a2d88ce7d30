//! Service entrypoint: scheduler loop, reminder re-entry, and a
//! line-oriented console transport. Chat platform adapters plug into the
//! same engine through the observer and sink traits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use murmur_cli::{build_runtime, init_tracing, load, ConsoleObserver, Runtime};
use murmur_core::session::{InboundMessage, SessionOutcome};
use murmur_schema::CancelToken;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "murmur", version, about = "murmur conversational assistant service")]
struct Cli {
    #[arg(long, help = "Path to the YAML config file")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::from(1);
        }
    };

    let config_dir = cli
        .config
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let _log_guard = match init_tracing(&config, &config_dir.join("logs")) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(config, config_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal runtime error: {e:#}");
            eprintln!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: murmur_config::AppConfig, config_dir: PathBuf) -> anyhow::Result<()> {
    let Runtime {
        config,
        engine,
        scheduler,
        fire_rx,
    } = build_runtime(config, &config_dir)?;

    if let Some(scheduler) = scheduler.clone() {
        tokio::spawn(async move {
            scheduler.run().await;
        });
        tracing::info!("reminder scheduler started");
    }

    if let Some(mut fire_rx) = fire_rx {
        let fire_engine = Arc::clone(&engine);
        let fire_config = config.clone();
        tokio::spawn(async move {
            while let Some(fire) = fire_rx.recv().await {
                let observer = Arc::new(ConsoleObserver::from_config(&fire_config));
                println!(
                    "🔔 [{}] 提醒 {}：{}",
                    fire.details.channel_ref, fire.details.user_ref, fire.details.content
                );
                let outcome = fire_engine
                    .handle_reminder_fire(&fire.details, observer, CancelToken::new())
                    .await;
                let ack = match outcome {
                    SessionOutcome::Replied { .. } => Ok(()),
                    SessionOutcome::ClaimedByTrend => Ok(()),
                    SessionOutcome::Refused { reason, .. } => {
                        tracing::warn!("reminder delivery refused: {reason}");
                        Ok(())
                    }
                    SessionOutcome::Failed { code, .. } => Err(format!("delivery failed: {code}")),
                };
                let _ = fire.ack.send(ack);
            }
        });
        tracing::info!("reminder fire consumer started");
    }

    println!("murmur console transport ready. 輸入訊息開始對話，/quit 離開。");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" || text == "/exit" {
                    break;
                }

                let observer = Arc::new(ConsoleObserver::from_config(&config));
                let inbound = InboundMessage::text_only("console", "console-user", text);
                match engine.handle(inbound, observer, CancelToken::new()).await {
                    SessionOutcome::Replied { warnings, .. } => {
                        for warning in warnings {
                            println!("⚠️  {warning}");
                        }
                    }
                    SessionOutcome::ClaimedByTrend => {}
                    SessionOutcome::Refused { reason, notify_user } => {
                        if notify_user {
                            println!("{reason}");
                        }
                    }
                    SessionOutcome::Failed { apology, code } => {
                        println!("{apology}");
                        tracing::warn!(code, "request failed");
                    }
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("murmur shutting down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
