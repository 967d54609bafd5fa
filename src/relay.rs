use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::error::RelayError;
use crate::platform::Notifier;
use crate::subscribers::{RecipientId, SubscriberRegistry};
use crate::twilio::{escape_markdown_v2, WebhookPayload};

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans webhook events out to subscribers, and admin notices out to owners.
pub struct Relay {
    registry: Arc<SubscriberRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl Relay {
    pub fn new(registry: Arc<SubscriberRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self { registry, notifier }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Send the payload to every current subscriber.
    pub async fn relay(&self, payload: &WebhookPayload) -> RelayReport {
        let subscribers = self.registry.list().await;
        info!(
            "Relaying {} from {} to {} subscriber(s)",
            payload.kind(),
            payload.from_number(),
            subscribers.len()
        );
        self.broadcast(&subscribers, &payload.to_markdown_v2()).await
    }

    /// Send administrative text to every owner. `text` is plain and gets
    /// escaped for the MarkdownV2 notifier.
    pub async fn notify_owners(&self, text: &str) -> RelayReport {
        let owners = self.registry.owners().to_vec();
        self.broadcast(&owners, &escape_markdown_v2(text)).await
    }

    async fn broadcast(&self, recipients: &[RecipientId], text: &str) -> RelayReport {
        let sends = recipients.iter().map(|&recipient| async move {
            self.notifier
                .send_message(recipient, text)
                .await
                .map_err(|e| RelayError::SendFailed {
                    recipient,
                    reason: format!("{:#}", e),
                })
        });

        let mut report = RelayReport::default();
        for result in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    error!("{}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
