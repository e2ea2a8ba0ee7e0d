//! Courier CLI entry point.
//!
//! Provides `start` to run the forwarder against the Telegram Bot API and
//! `check` to validate configuration without connecting to anything.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use courier::config::{load_dotenv, Config};
use courier::service::{shutdown_signal, ForwarderService, StopReason};
use courier::sinks::build_sink;
use courier::source::telegram::TelegramSource;
use courier::source::StaticMuteList;

/// Courier: forward Telegram messages to WeCom, Feishu or a custom HTTP API.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the forwarder until SIGINT or SIGTERM.
    Start {
        /// Config file (defaults to $COURIER_CONFIG or ./courier.toml).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Validate configuration and print the selected backend.
    Check {
        /// Config file (defaults to $COURIER_CONFIG or ./courier.toml).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { config } => handle_start(config.as_deref()).await,
        Command::Check { config } => handle_check(config.as_deref()),
    }
}

/// Run the forwarder.
async fn handle_start(path: Option<&Path>) -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::load(path).context("failed to load configuration")?;

    let logs_dir = config.logging.resolve_logs_dir()?;
    let _logging_guard = courier::logging::init_production(&logs_dir)?;

    let bot_token = config.bot_token()?.to_owned();
    let service =
        ForwarderService::from_config(&config).context("failed to build delivery backend")?;

    let mutes = Arc::new(StaticMuteList::new(config.telegram.muted_chats.clone()));
    let mut source = TelegramSource::new(&bot_token, config.telegram.poll_timeout_secs, mutes)
        .context("failed to create Telegram source")?;

    let report = service
        .run(&mut source, shutdown_signal())
        .await
        .context("forwarder failed to start")?;

    match report.reason {
        StopReason::SourceFailed(err) => Err(anyhow::Error::new(err).context("event source lost")),
        StopReason::Shutdown | StopReason::SourceEnded => {
            info!(lost = report.stats.lost(), "courier exited");
            Ok(())
        }
    }
}

/// Validate configuration and print a summary.
fn handle_check(path: Option<&Path>) -> anyhow::Result<()> {
    courier::logging::init_cli();
    load_dotenv();

    let config = Config::load(path).context("failed to load configuration")?;
    let sink = build_sink(&config).context("failed to build delivery backend")?;
    config.bot_token()?;

    let pipeline = &config.pipeline;
    println!("forwarder: {} (sink {})", config.forwarder.kind, sink.name());
    println!("filter: {}", config.filter.summary());
    println!(
        "pipeline: capacity={} workers={} max_retries={} grace={}s",
        pipeline.queue_capacity, pipeline.workers, pipeline.max_retries, pipeline.shutdown_grace_secs
    );
    println!("telegram: bot token configured, {} muted chat(s)", config.telegram.muted_chats.len());
    println!("configuration OK");
    Ok(())
}
