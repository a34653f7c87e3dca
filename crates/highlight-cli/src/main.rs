#![deny(unsafe_code)]

//! Highlight CLI: run the matcher against messages from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use highlight_config::AppConfig;
use highlight_core::{HighlightManager, MemoryStore};

/// Highlight: notify users when their words or patterns appear in chat.
#[derive(Parser)]
#[command(name = "highlight", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "highlight.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a single message and print its highlights as JSON.
    Scan {
        /// Guild the message was posted in.
        #[arg(long)]
        guild: String,

        /// Author of the message; never highlighted.
        #[arg(long)]
        author: String,

        /// Message id used to correlate the scan.
        #[arg(long, default_value = "cli")]
        message_id: String,

        /// Message content.
        content: String,
    },

    /// Read JSON messages from stdin, one per line, and print highlights.
    Stream,

    /// Check whether a regular-expression trigger compiles.
    Validate {
        /// Pattern to check, optionally prefixed with `re:`.
        pattern: String,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

/// One line of `stream` input.
#[derive(Debug, Deserialize)]
struct InboundMessage {
    guild_id: String,
    author_id: String,
    message_id: String,
    content: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Scan {
            guild,
            author,
            message_id,
            content,
        } => cmd_scan(config, guild, author, message_id, content).await?,
        Commands::Stream => cmd_stream(config).await?,
        Commands::Validate { pattern } => cmd_validate(config, pattern).await?,
        Commands::Config { show } => cmd_config(&config, &cli.config, show)?,
    }

    Ok(())
}

async fn cmd_scan(
    config: AppConfig,
    guild: String,
    author: String,
    message_id: String,
    content: String,
) -> Result<()> {
    let store = load_store(&config).await?;
    let manager = HighlightManager::start(config, store).await?;

    let highlights = manager
        .submit_message(guild, author, message_id, content)
        .await?;
    println!("{}", serde_json::to_string_pretty(&highlights)?);

    manager.destroy().await;
    Ok(())
}

async fn cmd_stream(config: AppConfig) -> Result<()> {
    let store = load_store(&config).await?;
    let manager = HighlightManager::start(config, store).await?;
    info!("Reading messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message: InboundMessage = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed input line");
                        continue;
                    }
                };
                let highlights = manager
                    .submit_message(
                        message.guild_id,
                        message.author_id,
                        message.message_id,
                        message.content,
                    )
                    .await?;
                println!("{}", serde_json::to_string(&highlights)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }

    manager.destroy().await;
    Ok(())
}

async fn cmd_validate(config: AppConfig, pattern: String) -> Result<()> {
    // Validation needs no subscriptions.
    let manager = HighlightManager::start(config, Arc::new(MemoryStore::default())).await?;
    let valid = manager.validate_pattern(pattern.as_str()).await?;
    manager.destroy().await;

    if valid {
        println!("Pattern '{pattern}' is valid.");
    } else {
        println!("Pattern '{pattern}' is invalid.");
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, config_path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist. The flag
/// reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

async fn load_store(config: &AppConfig) -> Result<Arc<MemoryStore>> {
    let path = Path::new(&config.store.path);
    if path.exists() {
        let store = MemoryStore::load(path)
            .await
            .with_context(|| format!("failed to load subscriptions from '{}'", path.display()))?;
        Ok(Arc::new(store))
    } else {
        warn!(path = %path.display(), "Subscriptions file not found, starting empty");
        Ok(Arc::new(MemoryStore::default()))
    }
}
