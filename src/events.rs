//! In-process publish/subscribe for change notifications.
//!
//! Every successful write publishes an [`Invalidation`] so connected clients
//! (the `/ws` feed) can refetch the affected views. Delivery is best effort:
//! slow subscribers that fall behind skip ahead and refetch anyway.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InvalidationKind {
    /// The chat list changed (new chat, title, ordering).
    Chats,
    #[serde(rename_all = "camelCase")]
    Messages { chat_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub user_id: String,
    pub kind: InvalidationKind,
}

impl Invalidation {
    pub fn chats(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: InvalidationKind::Chats,
        }
    }

    pub fn messages(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: InvalidationKind::Messages {
                chat_id: chat_id.into(),
            },
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<Invalidation>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: Invalidation) -> usize {
        tracing::trace!(user = %event.user_id, kind = ?event.kind, "publishing invalidation");
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Invalidation>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(Invalidation::messages("alice", "chat_1")), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id, "alice");
        assert_eq!(
            serde_json::to_value(&event.kind).unwrap(),
            serde_json::json!({ "type": "messages", "chatId": "chat_1" })
        );
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Invalidation::chats("alice")), 0);
        assert_eq!(
            serde_json::to_value(InvalidationKind::Chats).unwrap(),
            serde_json::json!({ "type": "chats" })
        );
    }
}
