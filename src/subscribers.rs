use tokio::sync::Mutex;
use tracing::info;

/// Telegram chat ID of a relay recipient
pub type RecipientId = i64;

/// In-memory subscriber list plus the fixed set of owners.
///
/// Subscribers keep insertion order and never hold duplicates. Owners are set
/// once at startup and receive administrative notifications only.
pub struct SubscriberRegistry {
    owners: Vec<RecipientId>,
    subscribers: Mutex<Vec<RecipientId>>,
}

impl SubscriberRegistry {
    pub fn new(owners: Vec<RecipientId>, subscribers: Vec<RecipientId>) -> Self {
        Self {
            owners: dedup(owners),
            subscribers: Mutex::new(dedup(subscribers)),
        }
    }

    /// Add a subscriber. Returns false if it was already subscribed.
    pub async fn add(&self, id: RecipientId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.contains(&id) {
            return false;
        }
        subscribers.push(id);
        info!("Subscriber {} added ({} total)", id, subscribers.len());
        true
    }

    /// Remove a subscriber. Returns false if it was not subscribed.
    pub async fn remove(&self, id: RecipientId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        match subscribers.iter().position(|s| *s == id) {
            Some(pos) => {
                subscribers.remove(pos);
                info!("Subscriber {} removed ({} total)", id, subscribers.len());
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: RecipientId) -> bool {
        self.subscribers.lock().await.contains(&id)
    }

    /// Snapshot of the current subscribers, in subscription order.
    pub async fn list(&self) -> Vec<RecipientId> {
        self.subscribers.lock().await.clone()
    }

    pub fn owners(&self) -> &[RecipientId] {
        &self.owners
    }

    pub fn is_owner(&self, id: RecipientId) -> bool {
        self.owners.contains(&id)
    }
}

fn dedup(ids: Vec<RecipientId>) -> Vec<RecipientId> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}
