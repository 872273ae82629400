use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Attachment, Channel, Connection, Content, Identity, MessageId, MessageKind, UserId},
    protocol::{MessagePayload, ServerEvent},
    time::canonical_now,
};
use storage::{MessageStore, StoredMessage};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    error::CoreError,
    history::render,
    presence::{Audience, Outbound, PresenceRegistry},
};

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub sender: Identity,
    pub channel: Channel,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

pub struct RoutedResult {
    pub message: MessagePayload,
    /// Connections the message was queued for.
    pub recipients: usize,
    /// Background store write. Dropping the handle does not cancel it.
    pub persistence: JoinHandle<Result<(), CoreError>>,
}

/// Store writes that were dispatched live but have not settled yet.
#[derive(Clone, Default)]
pub(crate) struct PendingWrites {
    inner: Arc<Mutex<HashMap<MessageId, watch::Receiver<bool>>>>,
}

impl PendingWrites {
    async fn begin(&self, id: MessageId) -> watch::Sender<bool> {
        let (done, receiver) = watch::channel(false);
        self.inner.lock().await.insert(id, receiver);
        done
    }

    async fn finish(&self, id: MessageId, done: watch::Sender<bool>) {
        self.inner.lock().await.remove(&id);
        let _ = done.send(true);
    }

    /// Waits until a pending write of `id`, if any, has succeeded or failed.
    pub(crate) async fn settled(&self, id: MessageId) {
        let receiver = self.inner.lock().await.get(&id).cloned();
        if let Some(mut receiver) = receiver {
            let _ = receiver.wait_for(|done| *done).await;
        }
    }

    async fn in_flight(&self) -> Vec<watch::Receiver<bool>> {
        self.inner.lock().await.values().cloned().collect()
    }
}

struct IdSequence {
    next: i64,
}

impl IdSequence {
    fn allocate(&mut self) -> MessageId {
        let id = MessageId(self.next);
        self.next += 1;
        id
    }
}

/// Fans messages out to live connections and persists them in the background.
///
/// All sends pass through one sequence lock: id assignment, timestamping and
/// enqueueing happen in the same critical section, so every recipient queue
/// sees messages in id order.
#[derive(Clone)]
pub struct MessageRouter {
    presence: PresenceRegistry,
    store: Arc<dyn MessageStore>,
    sequence: Arc<Mutex<IdSequence>>,
    pending: PendingWrites,
}

impl MessageRouter {
    pub(crate) async fn new(
        presence: PresenceRegistry,
        store: Arc<dyn MessageStore>,
        pending: PendingWrites,
    ) -> Result<Self, CoreError> {
        let next = store.next_message_id().await?;
        Ok(Self {
            presence,
            store,
            sequence: Arc::new(Mutex::new(IdSequence { next: next.0 })),
            pending,
        })
    }

    pub async fn route(&self, outgoing: OutgoingMessage) -> Result<RoutedResult, CoreError> {
        let content = content_from_parts(outgoing.kind, outgoing.attachment)?;
        if matches!(content, Content::Text) && outgoing.body.trim().is_empty() {
            return Err(CoreError::Validation("message body cannot be empty".into()));
        }
        let recipient = match outgoing.channel {
            Channel::Group => None,
            Channel::Direct(target) => Some(self.resolve_recipient(target).await?),
        };
        let audience = Audience::for_channel(outgoing.channel, outgoing.sender.id);

        let mut sequence = self.sequence.lock().await;
        let record = StoredMessage {
            id: sequence.allocate(),
            sender: outgoing.sender,
            recipient,
            body: outgoing.body,
            content,
            created_at: canonical_now(),
        };
        let message = render(&record);
        let done = self.pending.begin(record.id).await;
        let recipients = self
            .presence
            .dispatch(&audience, &ServerEvent::delivered(message.clone()))
            .await;
        drop(sequence);

        debug!(
            message_id = %record.id,
            sender_id = %record.sender.id,
            private = message.is_private,
            recipients,
            "message routed"
        );

        let persistence = tokio::spawn(persist(
            self.store.clone(),
            self.pending.clone(),
            record,
            done,
        ));

        Ok(RoutedResult {
            message,
            recipients,
            persistence,
        })
    }

    /// Registers `connection` between two sends, then waits for every write
    /// dispatched before it to settle. A history read after this returns
    /// covers everything the connection did not receive live.
    pub(crate) async fn admit(&self, connection: Connection, outbound: Outbound) {
        let in_flight = {
            let _sequence = self.sequence.lock().await;
            self.presence.register(connection, outbound).await;
            self.pending.in_flight().await
        };
        for mut receiver in in_flight {
            let _ = receiver.wait_for(|done| *done).await;
        }
    }

    /// Name to record for a direct-message target. A target nobody has seen
    /// is still addressable and is recorded under its bare id.
    async fn resolve_recipient(&self, target: UserId) -> Result<Identity, CoreError> {
        if target.0 <= 0 {
            return Err(CoreError::Validation(format!(
                "invalid target identity {target}"
            )));
        }
        if let Some(identity) = self.presence.online_identity(target).await {
            return Ok(identity);
        }
        if let Some(identity) = self.presence.known_identity(target).await {
            return Ok(identity);
        }
        match self.store.display_name_for(target).await {
            Ok(Some(display_name)) => Ok(Identity::new(target, display_name)),
            Ok(None) => {
                debug!(target_id = %target, "no display name on record; using bare id");
                Ok(Identity::new(target, target.to_string()))
            }
            Err(error) => {
                warn!(target_id = %target, %error, "display name lookup failed; delivering with bare id");
                Ok(Identity::new(target, target.to_string()))
            }
        }
    }
}

async fn persist(
    store: Arc<dyn MessageStore>,
    pending: PendingWrites,
    record: StoredMessage,
    done: watch::Sender<bool>,
) -> Result<(), CoreError> {
    let result = store.insert_message(&record).await;
    pending.finish(record.id, done).await;
    if let Err(error) = &result {
        error!(
            message_id = %record.id,
            %error,
            "failed to persist message; live delivery already completed"
        );
    }
    result.map_err(CoreError::from)
}

fn content_from_parts(
    kind: MessageKind,
    attachment: Option<Attachment>,
) -> Result<Content, CoreError> {
    match (kind, attachment) {
        (MessageKind::Text, None) => Ok(Content::Text),
        (MessageKind::Text, Some(_)) => Err(CoreError::Validation(
            "text messages cannot carry an attachment".into(),
        )),
        (_, None) => Err(CoreError::Validation(format!(
            "{} messages require an attachment",
            kind.as_str()
        ))),
        (_, Some(attachment)) if attachment.url.trim().is_empty() => Err(
            CoreError::Validation("attachment url cannot be empty".into()),
        ),
        (_, Some(attachment)) if i64::try_from(attachment.size_bytes).is_err() => Err(
            CoreError::Validation(format!(
                "attachment size {} is out of range",
                attachment.size_bytes
            )),
        ),
        (MessageKind::Image, Some(attachment)) => Ok(Content::Image { attachment }),
        (MessageKind::File, Some(attachment)) => Ok(Content::File { attachment }),
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
