use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::TribridgeConfig;
use tribridge_channels::{DiscordAdapter, Relay, TelegramAdapter};
use tribridge_core::AttachmentStore;
use tribridge_gateway::QqAdapter;

#[derive(Parser)]
#[command(name = "tribridge")]
#[command(version)]
#[command(about = "Relay chat messages across QQ, Discord and Telegram")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay daemon
    Start,

    /// Stop a running relay daemon
    Stop,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Stop => cmd_stop().await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        tracing::warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("tribridge initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure your tokens and channels.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TribridgeConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TribridgeConfig::load(config_path)?;
    info!("Starting tribridge daemon...");

    let cancel = CancellationToken::new();

    let store = Arc::new(AttachmentStore::new(
        cfg.attachments.dir.as_ref().map(PathBuf::from),
        Duration::from_secs(cfg.attachments.retention_mins * 60),
    ));

    let mut relay = Relay::new(cfg.relay.buffer_size, cfg.relay.dedup_capacity);

    if cfg.channels.qq.enabled {
        let qq = QqAdapter::new(
            cfg.channels.qq.url.clone(),
            cfg.channels.qq.self_id,
            cfg.channels.qq.group_id,
            store.clone(),
            Duration::from_secs(cfg.relay.command_timeout_secs),
        );
        relay.register(Arc::new(qq));
    }

    if cfg.channels.discord.enabled {
        let discord = DiscordAdapter::new(
            cfg.channels.discord.token.clone(),
            cfg.channels.discord.channel_id,
            store.clone(),
        );
        relay.register(Arc::new(discord));
    }

    if cfg.channels.telegram.enabled {
        let telegram = TelegramAdapter::new(
            cfg.channels.telegram.token.clone(),
            cfg.channels.telegram.chat_id,
            cfg.channels.telegram.poll_timeout_secs,
            store.clone(),
        );
        relay.register(Arc::new(telegram));
    }

    if relay.adapter_count() == 0 {
        anyhow::bail!("no channels enabled; edit your config and enable at least one");
    }

    relay.start_all().await;
    info!("{} adapters registered", relay.adapter_count());

    println!("tribridge is running. Press Ctrl+C to stop.");

    let relay_cancel = cancel.clone();
    let relay_loop = tokio::spawn(async move {
        relay.run(relay_cancel).await;
    });

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    let _ = relay_loop.await;

    // Delete downloaded attachments ahead of their retention timers
    store.cleanup_all().await;

    println!("tribridge stopped.");
    Ok(())
}

async fn cmd_stop() -> Result<()> {
    #[cfg(target_os = "windows")]
    let output = tokio::process::Command::new("taskkill")
        .args(["/IM", "tribridge.exe", "/F"])
        .output()
        .await?;

    #[cfg(not(target_os = "windows"))]
    let output = tokio::process::Command::new("pkill")
        .args(["-f", "tribridge start"])
        .output()
        .await?;

    if output.status.success() {
        println!("tribridge daemon stopped.");
    } else {
        println!("No running tribridge daemon found.");
    }
    Ok(())
}
