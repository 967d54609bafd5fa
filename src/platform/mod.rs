pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::subscribers::RecipientId;

/// A command received from the chat platform
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    /// Chat the command was sent from; replies and relays go here
    pub sender: RecipientId,
    /// Display name of the user, for logging
    pub user_name: String,
    /// The raw message text, e.g. "/subscribe" or "/help@smsbot"
    pub text: String,
}

/// Outbound message delivery to a single recipient
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, recipient: RecipientId, text: &str) -> Result<()>;
}
