use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::subscribers::RecipientId;

/// Command-line flags. Each one can also come from an `SMSBOT_*` variable and
/// overrides the matching value in the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "smsbot", version, about = "Relay Twilio SMS and calls to Telegram")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "SMSBOT_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "SMSBOT_LISTEN_HOST")]
    pub listen_host: Option<String>,

    #[arg(long, env = "SMSBOT_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    #[arg(long, env = "SMSBOT_TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    #[arg(long, env = "SMSBOT_TWILIO_AUTH_TOKEN", hide_env_values = true)]
    pub twilio_auth_token: Option<String>,

    /// Comma-separated owner chat IDs
    #[arg(long, env = "SMSBOT_OWNER_ID", value_delimiter = ',')]
    pub owner_id: Vec<RecipientId>,

    /// Comma-separated chat IDs subscribed at startup
    #[arg(long, env = "SMSBOT_DEFAULT_SUBSCRIBERS", value_delimiter = ',')]
    pub default_subscribers: Vec<RecipientId>,

    /// Public base URL Twilio calls, used to verify signatures behind a proxy
    #[arg(long, env = "SMSBOT_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub owners: Vec<RecipientId>,
    #[serde(default)]
    pub subscribers: Vec<RecipientId>,
    /// Only accept commands from owners
    #[serde(default)]
    pub restrict_to_owners: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TwilioConfig {
    /// Empty disables webhook signature validation
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            public_url: None,
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the optional config file, then apply CLI/env overrides.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.listen_host {
            self.webhook.listen_host = host.clone();
        }
        if let Some(port) = cli.listen_port {
            self.webhook.listen_port = port;
        }
        if let Some(url) = &cli.public_url {
            self.webhook.public_url = Some(url.clone());
        }
        if let Some(token) = &cli.telegram_bot_token {
            self.telegram.bot_token = token.clone();
        }
        if let Some(token) = &cli.twilio_auth_token {
            self.twilio.auth_token = token.clone();
        }
        if !cli.owner_id.is_empty() {
            self.telegram.owners = cli.owner_id.clone();
        }
        if !cli.default_subscribers.is_empty() {
            self.telegram.subscribers = cli.default_subscribers.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "Telegram bot token missing: set [telegram] bot_token, \
                 --telegram-bot-token or SMSBOT_TELEGRAM_BOT_TOKEN"
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.webhook.listen_host, self.webhook.listen_port)
    }
}
