mod commands;
mod config;
mod error;
mod metrics;
mod platform;
mod relay;
mod subscribers;
mod twilio;
mod webhook;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use teloxide::Bot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Config};
use crate::metrics::Metrics;
use crate::platform::telegram::TelegramNotifier;
use crate::relay::Relay;
use crate::subscribers::SubscriberRegistry;
use crate::webhook::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.debug { "debug" } else { "info,smsbot=debug" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("smsbot v{}", VERSION);

    let config = Config::resolve(&cli).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Listen: {}", config.listen_addr());
    info!("  Owners: {:?}", config.telegram.owners);
    info!("  Subscribers: {:?}", config.telegram.subscribers);
    if config.telegram.owners.is_empty() {
        warn!("No owner ID is set, which is not a good idea...");
    }
    if config.twilio.auth_token.is_empty() {
        warn!("No Twilio auth token set, webhook requests will not be validated");
    }

    let bot = Bot::new(&config.telegram.bot_token);
    let metrics = Metrics::new()?;
    let registry = Arc::new(SubscriberRegistry::new(
        config.telegram.owners.clone(),
        config.telegram.subscribers.clone(),
    ));
    let relay = Arc::new(Relay::new(
        registry.clone(),
        Arc::new(TelegramNotifier::new(bot.clone())),
    ));

    let state = AppState {
        relay: relay.clone(),
        metrics: metrics.clone(),
        auth_token: Arc::from(config.twilio.auth_token.as_str()),
        public_url: config.webhook.public_url.as_deref().map(Arc::from),
    };

    relay
        .notify_owners(&format!("smsbot v{} started", VERSION))
        .await;

    let addr = config.listen_addr();
    run_until_stopped(
        webhook::serve(state, &addr),
        platform::telegram::run(bot, registry, metrics, config.telegram.restrict_to_owners),
        shutdown_signal(),
    )
    .await?;

    info!("smsbot stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run the webhook server and the Telegram dispatcher until either one
/// finishes or `shutdown` resolves.
async fn run_until_stopped<S, B, F>(server: S, bot: B, shutdown: F) -> Result<()>
where
    S: Future<Output = Result<()>>,
    B: Future<Output = Result<()>>,
    F: Future<Output = ()>,
{
    tokio::select! {
        res = server => {
            res?;
            info!("Webhook server exited");
        }
        res = bot => {
            res?;
            info!("Telegram dispatcher exited");
        }
        _ = shutdown => info!("Shutdown signal received"),
    }
    Ok(())
}
