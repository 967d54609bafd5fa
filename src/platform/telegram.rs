use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::payloads::SendMessageSetters;
use teloxide::types::{ChatId, ParseMode};
use tracing::{debug, info, warn};

use crate::commands;
use crate::metrics::Metrics;
use crate::platform::{IncomingCommand, Notifier};
use crate::subscribers::{RecipientId, SubscriberRegistry};

/// Sends relay messages through the Telegram Bot API as MarkdownV2.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, recipient: RecipientId, text: &str) -> Result<()> {
        debug!("Sending message to chat {}", recipient);
        self.bot
            .send_message(ChatId(recipient), text)
            .parse_mode(ParseMode::MarkdownV2)
            .await
            .with_context(|| format!("Telegram send to chat {} failed", recipient))?;
        Ok(())
    }
}

/// The bot's own `@username`, used to ignore commands addressed to other bots.
#[derive(Debug, Clone, Default)]
pub struct BotUsername(pub Option<String>);

/// Whether an update from `user_id` may reach the command handler. With
/// `restrict_to_owners` set only owners pass, whether or not they subscribe.
pub fn accepts(registry: &SubscriberRegistry, restrict_to_owners: bool, user_id: u64) -> bool {
    !restrict_to_owners || registry.is_owner(user_id as RecipientId)
}

/// Run the Telegram command dispatcher until it is stopped
pub async fn run(
    bot: Bot,
    registry: Arc<SubscriberRegistry>,
    metrics: Metrics,
    restrict_to_owners: bool,
) -> Result<()> {
    info!("Starting Telegram platform...");

    let me = bot.get_me().await.context("Failed to fetch bot info")?;
    let username = BotUsername(me.user.username.clone());
    info!("Bot username: {:?}", username.0);

    let gate = registry.clone();
    let handler = Update::filter_message()
        .filter_map(move |msg: Message| {
            let user = msg.from.as_ref()?;
            if !accepts(&gate, restrict_to_owners, user.id.0) {
                debug!("Ignoring message from non-owner {}", user.id.0);
                return None;
            }
            Some(msg)
        })
        .endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![registry, metrics, username])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Telegram platform stopped");
    Ok(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    registry: Arc<SubscriberRegistry>,
    metrics: Metrics,
    username: BotUsername,
) -> ResponseResult<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };

    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    let incoming = IncomingCommand {
        sender: msg.chat.id.0,
        user_name: user
            .username
            .clone()
            .unwrap_or_else(|| user.first_name.clone()),
        text,
    };

    if let Some(reply) = commands::handle_command(&registry, &incoming, username.0.as_deref()).await {
        metrics.commands.inc();
        bot.send_message(msg.chat.id, reply).await?;
    }

    Ok(())
}
