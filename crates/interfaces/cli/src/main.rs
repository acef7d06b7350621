mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use confidant_config::{AppConfig, DEFAULT_CONFIG_PATH};
use confidant_llm::OpenAiCompatClient;
use confidant_runtime::{Collaborators, InboundMessage, TurnController};

use local::{LOCAL_CHANNEL_ID, LocalChannel};

const BOT_USER_ID: &str = "confidant";
const CHANNEL_LOG: &str = "channel.jsonl";

#[derive(Debug, Parser)]
#[command(name = "confidant", version, about = "A chat companion with memory and moods")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Talk to the bot on the console.
    Chat {
        #[arg(long, default_value = "local-user")]
        user: String,
    },
    /// Finalize stale sessions, extract facts, and send due follow-ups.
    Maintain,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration.
    Show,
    /// Write the default configuration file.
    Init {
        #[arg(long)]
        force: bool,
    },
}

/// Logs go to stderr (stdout carries the conversation) and, when
/// `telemetry.log_dir` is set, to a daily rolling file as well.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = if config.telemetry.log_dir.trim().is_empty() {
        (None, None)
    } else {
        let appender =
            tracing_appender::rolling::daily(config.telemetry.log_dir.trim(), "confidant.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _guard = init_tracing(&config);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                token.cancel();
            }
        });
    }

    match cli.command {
        Commands::Chat { user } => run_chat(config, &user, token).await,
        Commands::Maintain => run_maintain(config, token).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Init { force } => init_config(&cli.config, force),
        },
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save_to(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn open_channel(config: &AppConfig) -> Result<Arc<LocalChannel>> {
    let gap = TimeDelta::from_std(config.session_gap()).unwrap_or(TimeDelta::MAX);
    let path = Path::new(&config.memory.state_dir).join(CHANNEL_LOG);
    let channel = LocalChannel::open(path, BOT_USER_ID, &config.agent.name, gap)?;
    Ok(Arc::new(channel))
}

fn controller(
    config: AppConfig,
    channel: Arc<LocalChannel>,
    token: CancellationToken,
) -> Result<TurnController> {
    let llm = OpenAiCompatClient::from_config(&config.llm).context("failed to build llm client")?;
    let collab = Collaborators {
        llm: Arc::new(llm),
        history: channel.clone(),
        poster: channel.clone(),
        emitter: Some(channel.clone()),
        stickers: None,
        web: None,
    };
    Ok(TurnController::new(config, channel.bot_id(), collab, token))
}

async fn run_chat(config: AppConfig, user: &str, token: CancellationToken) -> Result<()> {
    let user = user.trim();
    if user.is_empty() {
        bail!("--user must not be empty");
    }
    let channel = open_channel(&config)?;
    let turns = controller(config, channel.clone(), token.clone())?;
    println!("chatting as {user} (Ctrl-C to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let content = line.trim();
        if content.is_empty() {
            continue;
        }

        let now = Utc::now();
        let message = channel.push(user, user, content, now);
        let inbound = InboundMessage {
            user_id: user.to_string(),
            channel_id: LOCAL_CHANNEL_ID.to_string(),
            message_id: message.id,
            content: content.to_string(),
            sent_at: Some(now),
        };
        if let Err(err) = turns.handle_message(&inbound).await {
            if token.is_cancelled() {
                break;
            }
            warn!(error = %err, "turn failed");
            eprintln!("(no reply: {err:#})");
        }
    }
    Ok(())
}

async fn run_maintain(config: AppConfig, token: CancellationToken) -> Result<()> {
    let channel = open_channel(&config)?;
    let turns = controller(config, channel, token)?;
    let report = turns.run_maintenance(Utc::now()).await?;
    println!(
        "users: {}  finalized: {}  fact passes: {}",
        report.users, report.finalized, report.fact_passes
    );
    Ok(())
}
