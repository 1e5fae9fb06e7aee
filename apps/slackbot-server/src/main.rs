//! Slackbot Server — realtime bot plus slash command and webhook endpoint.
//!
//! Opens a realtime session with the configured token, answers events with
//! the handlers in [`handlers::events`], and serves slash commands and
//! outgoing webhooks from [`handlers::commands`] on the configured address.

mod handlers;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use slackbot_core::config::{self, BotConfig};
use slackbot_core::{Bot, HandlerRegistry, WebhookRouter};
use tokio::sync::watch;
use tracing::{info, warn};

/// Slack bot server.
#[derive(Debug, Parser)]
#[command(name = "slackbot-server")]
#[command(author, version, about = "Slack bot server: realtime events and webhooks")]
struct Cli {
    /// Path to the config file (defaults to ~/.slackbot/config.yml).
    #[arg(long, env = "SLACKBOT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with env filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("slackbot=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path().context("Failed to determine config path")?,
    };
    let bot_config = BotConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");

    // Setup graceful shutdown on SIGINT/SIGTERM
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Connect the realtime session
    let mut events = HandlerRegistry::new();
    handlers::events::register(&mut events);

    info!("Connecting realtime session...");
    let bot = Bot::connect(&bot_config, events)
        .await
        .context("Failed to connect realtime session")?;
    let mut bot = bot.spawn();

    // Webhook endpoint posts back through the bot's outbox
    let mut router = WebhookRouter::new(bot_config.slack.payload_token.clone());
    handlers::commands::register(&mut router, bot.outbox());

    let realtime = async {
        tokio::select! {
            result = bot.join() => result.context("Realtime event loop failed"),
            () = shutdown(shutdown_rx.clone()) => {
                bot.abort();
                info!("Realtime event loop stopped");
                Ok(())
            }
        }
    };
    let webhook = async {
        router
            .serve(
                bot_config.webhook.bind,
                &bot_config.webhook.path,
                shutdown(shutdown_rx.clone()),
            )
            .await
            .context("Webhook listener failed")
    };

    tokio::try_join!(realtime, webhook)?;

    info!("Server shut down cleanly");
    Ok(())
}

/// Resolves once shutdown has been requested.
async fn shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot register SIGTERM handler, waiting for SIGINT only");
                ctrl_c.await.ok();
                info!("Received SIGINT, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT, shutting down...");
    }
}
