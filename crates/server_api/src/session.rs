use shared::{
    domain::{Connection, ConnectionId, Identity},
    error::ApiError,
    protocol::ServerEvent,
};
use tracing::{debug, warn};

use crate::{
    error::CoreError,
    presence::{Outbound, PresenceRegistry},
};

/// A registered connection. Dropping a session that was not closed through
/// [`crate::ApiContext::disconnect`] still removes it from the registry.
pub struct Session {
    connection: Connection,
    outbound: Outbound,
    presence: PresenceRegistry,
    registered: bool,
}

impl Session {
    pub(crate) fn new(connection: Connection, outbound: Outbound, presence: PresenceRegistry) -> Self {
        Self {
            connection,
            outbound,
            presence,
            registered: true,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.connection.identity
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Sends an event to this connection only.
    pub fn reply(&self, event: ServerEvent) {
        if self.outbound.send(event).is_err() {
            debug!(connection_id = %self.connection.connection_id, "reply dropped; outbound queue closed");
        }
    }

    pub(crate) fn reply_error(&self, error: CoreError) {
        warn!(
            connection_id = %self.connection.connection_id,
            user_id = %self.connection.identity.id,
            %error,
            "request failed"
        );
        self.reply(ServerEvent::Error(ApiError::from(error)));
    }

    pub(crate) fn disarm(&mut self) {
        self.registered = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let presence = self.presence.clone();
        let connection_id = self.connection.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    presence.unregister(connection_id).await;
                });
            }
            Err(_) => warn!(%connection_id, "session dropped outside runtime; registry entry leaked"),
        }
    }
}
