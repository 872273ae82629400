use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{Channel, Identity, MessageId},
    protocol::ServerEvent,
};
use storage::MessageStore;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    blobs::BlobStore,
    error::CoreError,
    presence::{Audience, PresenceRegistry},
    router::PendingWrites,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetractionResult {
    pub message_id: MessageId,
    pub channel: Channel,
    /// Connections the recall notice was queued for.
    pub notified: usize,
}

#[derive(Default)]
struct Slot {
    lock: Arc<Mutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

/// One lock per message id currently being retracted. A slot lives exactly as
/// long as some `KeyGuard` for its id does.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<StdMutex<HashMap<MessageId, Slot>>>,
}

impl KeyedLocks {
    fn slots(&self) -> MutexGuard<'_, HashMap<MessageId, Slot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(&self, id: MessageId) -> KeyGuard {
        let lock = {
            let mut slots = self.slots();
            let slot = slots.entry(id).or_default();
            slot.users += 1;
            slot.lock.clone()
        };
        // created before the wait so a cancelled acquire still gives its slot back
        let mut key = KeyGuard {
            id,
            locks: self.clone(),
            held: None,
        };
        key.held = Some(lock.lock_owned().await);
        key
    }
}

struct KeyGuard {
    id: MessageId,
    locks: KeyedLocks,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut slots = self.locks.slots();
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct RetractionCoordinator {
    presence: PresenceRegistry,
    store: Arc<dyn MessageStore>,
    blobs: Arc<dyn BlobStore>,
    pending: PendingWrites,
    locks: KeyedLocks,
}

impl RetractionCoordinator {
    pub(crate) fn new(
        presence: PresenceRegistry,
        store: Arc<dyn MessageStore>,
        blobs: Arc<dyn BlobStore>,
        pending: PendingWrites,
    ) -> Self {
        Self {
            presence,
            store,
            blobs,
            pending,
            locks: KeyedLocks::default(),
        }
    }

    /// Deletes `message_id` on behalf of `requester` and tells every party who
    /// could see it. Attempts on the same id run one at a time, so a second
    /// attempt observes `NotFound`.
    pub async fn retract(
        &self,
        message_id: MessageId,
        requester: &Identity,
    ) -> Result<RetractionResult, CoreError> {
        let _key = self.locks.acquire(message_id).await;
        self.retract_exclusive(message_id, requester).await
    }

    async fn retract_exclusive(
        &self,
        message_id: MessageId,
        requester: &Identity,
    ) -> Result<RetractionResult, CoreError> {
        // a message recalled right after sending may still be on its way to the store
        self.pending.settled(message_id).await;

        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id} not found")))?;

        if message.sender.id != requester.id {
            warn!(
                %message_id,
                requester_id = %requester.id,
                sender_id = %message.sender.id,
                "recall rejected: requester is not the sender"
            );
            return Err(CoreError::Forbidden(
                "only the sender can recall a message".into(),
            ));
        }

        if !self.store.delete_message(message_id).await? {
            return Err(CoreError::NotFound(format!(
                "message {message_id} not found"
            )));
        }

        let channel = message.channel();
        let notified = self
            .presence
            .dispatch(
                &Audience::for_channel(channel, message.sender.id),
                &ServerEvent::MessageRecalled { message_id },
            )
            .await;
        info!(%message_id, sender_id = %message.sender.id, notified, "message recalled");

        if let Some(attachment) = message.content.attachment() {
            match self.blobs.delete(attachment).await {
                Ok(removed) => debug!(%message_id, url = %attachment.url, removed, "attachment cleanup"),
                Err(error) => warn!(
                    %message_id,
                    url = %attachment.url,
                    %error,
                    "failed to delete attachment blob"
                ),
            }
        }

        Ok(RetractionResult {
            message_id,
            channel,
            notified,
        })
    }
}

#[cfg(test)]
#[path = "tests/retraction_tests.rs"]
mod tests;
