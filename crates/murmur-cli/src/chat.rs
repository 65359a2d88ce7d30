//! Interactive tester: a REPL against the same engine the service runs,
//! with verbose progress output for poking at configs and prompts.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use murmur_cli::{build_runtime, init_tracing, load, ConsoleObserver, Runtime};
use murmur_core::session::{InboundMessage, SessionOutcome};
use murmur_schema::CancelToken;

#[derive(Parser)]
#[command(name = "murmur-chat", version, about = "interactive murmur tester")]
struct Cli {
    #[arg(long, help = "Path to the YAML config file")]
    config: PathBuf,

    #[arg(long, default_value = "repl", help = "Channel ref used for the session")]
    channel: String,

    #[arg(long, default_value = "tester", help = "User ref used for the session")]
    user: String,
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

    match run(config, config_dir, &cli.channel, &cli.user).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(
    config: murmur_config::AppConfig,
    config_dir: PathBuf,
    channel: &str,
    user: &str,
) -> anyhow::Result<()> {
    let Runtime {
        config,
        engine,
        scheduler,
        fire_rx,
    } = build_runtime(config, &config_dir)?;

    if let Some(scheduler) = scheduler {
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }
    if let Some(mut fire_rx) = fire_rx {
        let fire_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(fire) = fire_rx.recv().await {
                println!("\n🔔 提醒：{}", fire.details.content);
                let outcome = fire_engine
                    .handle_reminder_fire(
                        &fire.details,
                        Arc::new(ConsoleObserver::quiet()),
                        CancelToken::new(),
                    )
                    .await;
                let ack = match outcome {
                    SessionOutcome::Failed { code, .. } => Err(code.to_string()),
                    _ => Ok(()),
                };
                let _ = fire.ack.send(ack);
            }
        });
    }

    println!("murmur 互動測試模式。輸入 quit 離開。");
    println!("---");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        let observer = Arc::new(ConsoleObserver::from_config(&config));
        let inbound = InboundMessage::text_only(channel, user, input);
        match engine.handle(inbound, observer, CancelToken::new()).await {
            SessionOutcome::Replied { warnings, reminder_ids, .. } => {
                for id in reminder_ids {
                    println!("⏰ 已排定提醒 #{id}");
                }
                for warning in warnings {
                    println!("⚠️  {warning}");
                }
            }
            SessionOutcome::ClaimedByTrend => println!("(跟風模組接手了這則訊息)"),
            SessionOutcome::Refused { reason, notify_user } => {
                if notify_user {
                    println!("{reason}");
                }
            }
            SessionOutcome::Failed { apology, .. } => println!("{apology}"),
        }
    }

    Ok(())
}
