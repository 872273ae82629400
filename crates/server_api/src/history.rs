use std::sync::Arc;

use shared::{
    domain::UserId,
    protocol::{MessagePayload, ThreadSummary},
};
use storage::{MessageStore, StoredMessage};

use crate::error::CoreError;

pub const DEFAULT_GROUP_HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_PRIVATE_HISTORY_LIMIT: u32 = 100;

/// Read side over the persisted store. Retracted messages never show up
/// because retraction deletes the row.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn MessageStore>,
    group_limit: u32,
    private_limit: u32,
}

impl HistoryService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            group_limit: DEFAULT_GROUP_HISTORY_LIMIT,
            private_limit: DEFAULT_PRIVATE_HISTORY_LIMIT,
        }
    }

    pub fn with_limits(mut self, group_limit: u32, private_limit: u32) -> Self {
        self.group_limit = group_limit.max(1);
        self.private_limit = private_limit.max(1);
        self
    }

    /// Most recent group messages, oldest first. `None` uses the configured limit.
    pub async fn group_history(&self, limit: Option<u32>) -> Result<Vec<MessagePayload>, CoreError> {
        let limit = limit.unwrap_or(self.group_limit);
        let messages = self.store.recent_group_messages(limit).await?;
        Ok(messages.iter().map(render).collect())
    }

    /// Direct messages between `self_id` and `other_id`, oldest first.
    /// `self_id` must come from the live connection, never from the request.
    pub async fn private_history(
        &self,
        self_id: UserId,
        other_id: UserId,
        limit: Option<u32>,
    ) -> Result<Vec<MessagePayload>, CoreError> {
        let limit = limit.unwrap_or(self.private_limit);
        let messages = self.store.private_messages(self_id, other_id, limit).await?;
        Ok(messages.iter().map(render).collect())
    }

    pub async fn private_threads_for(&self, user_id: UserId) -> Result<Vec<ThreadSummary>, CoreError> {
        let threads = self.store.private_threads(user_id).await?;
        Ok(threads
            .into_iter()
            .map(|thread| ThreadSummary {
                other_identity: thread.other.id,
                other_display_name: thread.other.display_name,
                last_message_at: thread.last_message_at,
            })
            .collect())
    }
}

/// Client rendering of a stored message. Live delivery uses the same function,
/// so both paths share one timestamp basis.
pub(crate) fn render(message: &StoredMessage) -> MessagePayload {
    MessagePayload {
        id: message.id,
        sender_identity: message.sender.clone(),
        recipient_identity: message.recipient.clone(),
        body: message.body.clone(),
        content: message.content.clone(),
        created_at: message.created_at,
        is_private: message.recipient.is_some(),
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
