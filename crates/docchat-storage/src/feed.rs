//! Broadcast of newly inserted rows.

use tokio::sync::broadcast;
use uuid::Uuid;

use docchat_core::types::{Message, RowInserted};

const DEFAULT_CAPACITY: usize = 256;

/// Publishes every row the repositories insert.
///
/// Subscribers only see rows inserted after they subscribed. A subscriber
/// that falls more than the channel capacity behind skips the oldest rows.
#[derive(Clone, Debug)]
pub struct InsertFeed {
    tx: broadcast::Sender<RowInserted>,
}

impl InsertFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, row: RowInserted) {
        // No subscribers is the common case.
        let _ = self.tx.send(row);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowInserted> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InsertFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Pick out the message rows that belong to one conversation.
pub fn message_for(row: RowInserted, conversation_id: Uuid) -> Option<Message> {
    match row {
        RowInserted::ConversationMessages(msg) if msg.conversation_id == conversation_id => {
            Some(msg)
        }
        _ => None,
    }
}
