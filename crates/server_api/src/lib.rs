pub mod blobs;
pub mod error;
pub mod gatekeeper;
pub mod history;
pub mod presence;
pub mod retraction;
pub mod router;
pub mod session;

use std::sync::Arc;

use shared::{
    domain::{Attachment, Channel, Connection, ConnectionId, Identity, MessageKind, UserId},
    protocol::{ClientRequest, ServerEvent},
    time::canonical_now,
};
use storage::MessageStore;
use tokio::sync::mpsc;
use tracing::warn;

pub use blobs::{BlobStore, LocalBlobStore};
pub use error::CoreError;
pub use gatekeeper::{Gatekeeper, JwtGatekeeper};
pub use history::HistoryService;
pub use presence::{Audience, PresenceRegistry};
pub use retraction::{RetractionCoordinator, RetractionResult};
pub use router::{MessageRouter, OutgoingMessage, RoutedResult};
pub use session::Session;

/// The coordinator: one presence registry shared by the router, the
/// retraction coordinator and every session.
#[derive(Clone)]
pub struct ApiContext {
    pub presence: PresenceRegistry,
    pub router: MessageRouter,
    pub retractions: RetractionCoordinator,
    pub history: HistoryService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceCounts {
    pub identities: usize,
    pub connections: usize,
}

impl ApiContext {
    pub async fn new(
        store: Arc<dyn MessageStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, CoreError> {
        let presence = PresenceRegistry::new();
        let pending = router::PendingWrites::default();
        let router = MessageRouter::new(presence.clone(), store.clone(), pending.clone()).await?;
        let retractions = RetractionCoordinator::new(presence.clone(), store.clone(), blobs, pending);
        Ok(Self {
            presence,
            router,
            retractions,
            history: HistoryService::new(store),
        })
    }

    pub fn with_history_limits(mut self, group_limit: u32, private_limit: u32) -> Self {
        self.history = self.history.with_limits(group_limit, private_limit);
        self
    }

    /// Admits an authenticated identity: registers the connection (which
    /// broadcasts the roster) and replays recent group history to it. Group
    /// messages sent before registration whose writes are still pending are
    /// waited for, so each one arrives either live or in the replay.
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let connection = Connection {
            connection_id: ConnectionId::new(),
            identity,
            established_at: canonical_now(),
        };
        self.router
            .admit(connection.clone(), outbound.clone())
            .await;
        let session = Session::new(connection, outbound, self.presence.clone());

        let history = match self.history.group_history(None).await {
            Ok(messages) => messages,
            Err(error) => {
                warn!(connection_id = %session.connection_id(), %error, "group history replay failed");
                Vec::new()
            }
        };
        session.reply(ServerEvent::MessageHistory(history));

        (session, inbound)
    }

    pub async fn disconnect(&self, mut session: Session) {
        session.disarm();
        self.presence.unregister(session.connection_id()).await;
    }

    pub async fn presence_counts(&self) -> PresenceCounts {
        let roster = self.presence.roster().await;
        PresenceCounts {
            identities: roster.len(),
            connections: roster.iter().map(|entry| entry.connections).sum(),
        }
    }

    /// Handles one client event. Results and errors go only to `session`;
    /// fan-out goes through the router and the retraction coordinator.
    pub async fn handle_request(&self, session: &Session, request: ClientRequest) {
        match request {
            ClientRequest::Message {
                body,
                kind,
                attachment,
            } => {
                self.send(session, Channel::Group, body, kind, attachment)
                    .await
            }
            ClientRequest::PrivateMessage {
                target_identity: Some(target),
                body,
                kind,
                attachment,
            } => {
                self.send(session, Channel::Direct(target), body, kind, attachment)
                    .await
            }
            ClientRequest::PrivateMessage {
                target_identity: None,
                ..
            } => session.reply_error(CoreError::Validation(
                "private message requires targetIdentity".into(),
            )),
            ClientRequest::GetGroupMessages {} => match self.history.group_history(None).await {
                Ok(messages) => session.reply(ServerEvent::MessageHistory(messages)),
                Err(error) => session.reply_error(error),
            },
            ClientRequest::GetPrivateMessages { other_identity } => {
                match self
                    .history
                    .private_history(session.identity().id, other_identity, None)
                    .await
                {
                    Ok(messages) => session.reply(ServerEvent::PrivateMessageHistory(messages)),
                    Err(error) => session.reply_error(error),
                }
            }
            ClientRequest::GetPrivateChatsList {} => {
                match self.history.private_threads_for(session.identity().id).await {
                    Ok(threads) => session.reply(ServerEvent::PrivateChatsList(threads)),
                    Err(error) => session.reply_error(error),
                }
            }
            ClientRequest::RecallMessage { message_id } => {
                if let Err(error) = self
                    .retractions
                    .retract(message_id, session.identity())
                    .await
                {
                    warn!(
                        connection_id = %session.connection_id(),
                        %message_id,
                        %error,
                        "recall failed"
                    );
                    session.reply(ServerEvent::RecallError {
                        reason: error.into(),
                    });
                }
            }
            ClientRequest::Typing {
                is_typing,
                target_identity,
            } => self.relay_typing(session, is_typing, target_identity).await,
        }
    }

    async fn send(
        &self,
        session: &Session,
        channel: Channel,
        body: String,
        kind: MessageKind,
        attachment: Option<Attachment>,
    ) {
        let outgoing = OutgoingMessage {
            sender: session.identity().clone(),
            channel,
            body,
            kind,
            attachment,
        };
        // the persistence task logs its own failure and is left detached
        if let Err(error) = self.router.route(outgoing).await {
            session.reply_error(error);
        }
    }

    async fn relay_typing(
        &self,
        session: &Session,
        is_typing: bool,
        target: Option<UserId>,
    ) {
        let audience = match target {
            Some(target) => Audience::Identities(vec![target]),
            None => Audience::EveryoneExcept(session.connection_id()),
        };
        let identity = session.identity();
        self.presence
            .dispatch(
                &audience,
                &ServerEvent::Typing {
                    identity: identity.id,
                    display_name: identity.display_name.clone(),
                    is_typing,
                },
            )
            .await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
