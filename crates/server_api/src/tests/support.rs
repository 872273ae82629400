use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{Attachment, Identity, MessageId, UserId},
    protocol::ServerEvent,
};
use storage::{MessageStore, Storage, StoreError, StoreResult, StoredMessage, StoredThread};
use tokio::sync::{mpsc::UnboundedReceiver, Mutex};

use crate::{blobs::BlobStore, ApiContext};

pub(crate) fn identity(id: i64, name: &str) -> Identity {
    Identity::new(UserId(id), name)
}

pub(crate) fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) async fn memory_store() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

pub(crate) async fn context(store: Arc<dyn MessageStore>) -> (ApiContext, Arc<RecordingBlobs>) {
    let blobs = Arc::new(RecordingBlobs::default());
    let ctx = ApiContext::new(store, blobs.clone()).await.expect("context");
    (ctx, blobs)
}

/// Remembers every blob deletion request; optionally fails them.
#[derive(Default)]
pub(crate) struct RecordingBlobs {
    pub(crate) deleted: Mutex<Vec<String>>,
    pub(crate) fail: AtomicBool,
}

#[async_trait]
impl BlobStore for RecordingBlobs {
    async fn delete(&self, attachment: &Attachment) -> io::Result<bool> {
        self.deleted.lock().await.push(attachment.url.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"));
        }
        Ok(true)
    }
}

/// SQLite store whose writes can be switched to fail or slowed down.
pub(crate) struct FlakyStore {
    inner: Storage,
    pub(crate) fail_inserts: AtomicBool,
    pub(crate) fail_deletes: AtomicBool,
    pub(crate) insert_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub(crate) async fn new() -> Self {
        Self {
            inner: memory_store().await,
            fail_inserts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            insert_delay_ms: AtomicU64::new(0),
        }
    }
}

fn unavailable() -> StoreError {
    StoreError::Timeout(Duration::from_millis(50))
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn next_message_id(&self) -> StoreResult<MessageId> {
        self.inner.next_message_id().await
    }

    async fn insert_message(&self, message: &StoredMessage) -> StoreResult<()> {
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.insert_message(message).await
    }

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<StoredMessage>> {
        self.inner.find_message(id).await
    }

    async fn delete_message(&self, id: MessageId) -> StoreResult<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.delete_message(id).await
    }

    async fn recent_group_messages(&self, limit: u32) -> StoreResult<Vec<StoredMessage>> {
        self.inner.recent_group_messages(limit).await
    }

    async fn private_messages(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.inner.private_messages(a, b, limit).await
    }

    async fn private_threads(&self, user: UserId) -> StoreResult<Vec<StoredThread>> {
        self.inner.private_threads(user).await
    }

    async fn display_name_for(&self, user: UserId) -> StoreResult<Option<String>> {
        self.inner.display_name_for(user).await
    }
}
