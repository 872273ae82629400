//! Live connection registry.
//!
//! Every mutation and every roster broadcast happens while holding the single
//! registry lock, so a broadcast roster always matches the registry contents at
//! that instant.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{Channel, Connection, ConnectionId, Identity, UserId},
    protocol::{PresenceNotice, RosterEntry, ServerEvent},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Per-connection outbound queue drained by the transport task.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Who receives a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    EveryoneExcept(ConnectionId),
    /// Every connection owned by any of these identities, each connection once.
    Identities(Vec<UserId>),
    Connection(ConnectionId),
}

impl Audience {
    /// Everyone who may see traffic of `channel` sent by `sender`.
    pub fn for_channel(channel: Channel, sender: UserId) -> Self {
        match channel {
            Channel::Group => Audience::Everyone,
            Channel::Direct(target) => Audience::Identities(vec![target, sender]),
        }
    }
}

struct Entry {
    connection: Connection,
    outbound: Outbound,
}

#[derive(Default)]
struct Roster {
    entries: HashMap<ConnectionId, Entry>,
    /// Every identity admitted since startup. Never pruned on disconnect.
    seen: HashMap<UserId, Identity>,
}

impl Roster {
    fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.entries
            .values()
            .filter(|entry| entry.connection.identity.id == user_id)
            .map(|entry| entry.connection.connection_id)
            .collect()
    }

    fn snapshot(&self) -> Vec<RosterEntry> {
        let mut by_identity: BTreeMap<UserId, RosterEntry> = BTreeMap::new();
        for entry in self.entries.values() {
            let identity = &entry.connection.identity;
            by_identity
                .entry(identity.id)
                .or_insert_with(|| RosterEntry {
                    identity: identity.id,
                    display_name: identity.display_name.clone(),
                    connections: 0,
                })
                .connections += 1;
        }
        by_identity.into_values().collect()
    }

    fn includes(audience: &Audience, entry: &Entry) -> bool {
        match audience {
            Audience::Everyone => true,
            Audience::EveryoneExcept(excluded) => entry.connection.connection_id != *excluded,
            Audience::Identities(users) => users.contains(&entry.connection.identity.id),
            Audience::Connection(target) => entry.connection.connection_id == *target,
        }
    }

    fn send(&self, audience: &Audience, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for entry in self.entries.values() {
            if !Self::includes(audience, entry) {
                continue;
            }
            // a closed queue means the transport is already tearing down
            if entry.outbound.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(connection_id = %entry.connection.connection_id, "outbound queue closed");
            }
        }
        delivered
    }
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<Roster>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and broadcasts the new roster to everyone, the new
    /// connection included. Other connections hear `user-joined` when this is
    /// the identity's first live connection.
    pub async fn register(&self, connection: Connection, outbound: Outbound) {
        let mut roster = self.inner.lock().await;
        let connection_id = connection.connection_id;
        let identity = connection.identity.clone();
        let first_for_identity = roster.connections_for(identity.id).is_empty();
        roster.seen.insert(identity.id, identity.clone());

        if roster
            .entries
            .insert(connection_id, Entry { connection, outbound })
            .is_some()
        {
            warn!(%connection_id, "connection id registered twice; replacing entry");
        }

        if first_for_identity {
            roster.send(
                &Audience::EveryoneExcept(connection_id),
                &ServerEvent::UserJoined(PresenceNotice::from(&identity)),
            );
        }
        let snapshot = roster.snapshot();
        roster.send(&Audience::Everyone, &ServerEvent::UsersList(snapshot));

        info!(
            %connection_id,
            user_id = %identity.id,
            display_name = %identity.display_name,
            online = roster.entries.len(),
            "connection registered"
        );
    }

    /// Removes a connection. Absent ids are a no-op and broadcast nothing.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        let mut roster = self.inner.lock().await;
        let entry = roster.entries.remove(&connection_id)?;
        let identity = &entry.connection.identity;

        if roster.connections_for(identity.id).is_empty() {
            roster.send(
                &Audience::Everyone,
                &ServerEvent::UserLeft(PresenceNotice::from(identity)),
            );
        }
        let snapshot = roster.snapshot();
        roster.send(&Audience::Everyone, &ServerEvent::UsersList(snapshot));

        info!(
            %connection_id,
            user_id = %identity.id,
            online = roster.entries.len(),
            "connection unregistered"
        );
        Some(entry.connection)
    }

    pub async fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.inner.lock().await.connections_for(user_id)
    }

    pub async fn all_connections(&self) -> HashSet<ConnectionId> {
        self.inner.lock().await.entries.keys().copied().collect()
    }

    pub async fn roster(&self) -> Vec<RosterEntry> {
        self.inner.lock().await.snapshot()
    }

    /// Identity behind any live connection of `user_id`.
    pub async fn online_identity(&self, user_id: UserId) -> Option<Identity> {
        self.inner
            .lock()
            .await
            .entries
            .values()
            .find(|entry| entry.connection.identity.id == user_id)
            .map(|entry| entry.connection.identity.clone())
    }

    /// Last identity admitted under `user_id`, online or not.
    pub async fn known_identity(&self, user_id: UserId) -> Option<Identity> {
        self.inner.lock().await.seen.get(&user_id).cloned()
    }

    /// Resolves `audience` and enqueues `event` for each member under one lock.
    /// Returns the number of connections the event was queued for.
    pub async fn dispatch(&self, audience: &Audience, event: &ServerEvent) -> usize {
        self.inner.lock().await.send(audience, event)
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
