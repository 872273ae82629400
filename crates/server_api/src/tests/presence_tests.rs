use super::*;
use shared::time::canonical_now;
use tokio::sync::mpsc::UnboundedReceiver;

fn identity(id: i64, name: &str) -> Identity {
    Identity::new(UserId(id), name)
}

fn connection(identity: &Identity) -> (Connection, Outbound, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Connection {
            connection_id: ConnectionId::new(),
            identity: identity.clone(),
            established_at: canonical_now(),
        },
        tx,
        rx,
    )
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn last_roster(events: &[ServerEvent]) -> Vec<(UserId, usize)> {
    events
        .iter()
        .rev()
        .find_map(|event| match event {
            ServerEvent::UsersList(roster) => Some(
                roster
                    .iter()
                    .map(|entry| (entry.identity, entry.connections))
                    .collect(),
            ),
            _ => None,
        })
        .expect("roster broadcast")
}

#[tokio::test]
async fn register_broadcasts_roster_to_new_connection_too() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let (conn, tx, mut rx) = connection(&alice);

    registry.register(conn, tx).await;

    let events = drain(&mut rx);
    assert_eq!(last_roster(&events), vec![(UserId(1), 1)]);
    assert!(!events
        .iter()
        .any(|event| matches!(event, ServerEvent::UserJoined(_))));
}

#[tokio::test]
async fn existing_connections_hear_user_joined_once_per_identity() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let (a_conn, a_tx, mut a_rx) = connection(&alice);
    registry.register(a_conn, a_tx).await;
    drain(&mut a_rx);

    let (b1, b1_tx, _b1_rx) = connection(&bob);
    registry.register(b1, b1_tx).await;
    let (b2, b2_tx, _b2_rx) = connection(&bob);
    registry.register(b2, b2_tx).await;

    let events = drain(&mut a_rx);
    let joins: Vec<&PresenceNotice> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::UserJoined(notice) => Some(notice),
            _ => None,
        })
        .collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].identity, bob.id);
    assert_eq!(joins[0].display_name, "bob");
    assert_eq!(last_roster(&events), vec![(UserId(1), 1), (UserId(2), 2)]);
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let (a_conn, a_tx, mut a_rx) = connection(&alice);
    let (b_conn, b_tx, _b_rx) = connection(&bob);
    let b_id = b_conn.connection_id;
    registry.register(a_conn, a_tx).await;
    registry.register(b_conn, b_tx).await;
    drain(&mut a_rx);

    assert!(registry.unregister(b_id).await.is_some());
    let events = drain(&mut a_rx);
    assert!(events.iter().any(
        |event| matches!(event, ServerEvent::UserLeft(notice) if notice.identity == bob.id)
    ));
    assert_eq!(last_roster(&events), vec![(UserId(1), 1)]);

    assert!(registry.unregister(b_id).await.is_none());
    assert!(drain(&mut a_rx).is_empty());
}

#[tokio::test]
async fn closing_one_of_two_devices_keeps_identity_online() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let (watcher, w_tx, mut w_rx) = connection(&alice);
    registry.register(watcher, w_tx).await;

    let (phone, p_tx, _p_rx) = connection(&bob);
    let (laptop, l_tx, _l_rx) = connection(&bob);
    let phone_id = phone.connection_id;
    registry.register(phone, p_tx).await;
    registry.register(laptop, l_tx).await;
    drain(&mut w_rx);

    registry.unregister(phone_id).await;

    let events = drain(&mut w_rx);
    assert!(!events
        .iter()
        .any(|event| matches!(event, ServerEvent::UserLeft(_))));
    assert_eq!(last_roster(&events), vec![(UserId(1), 1), (UserId(2), 1)]);
    assert_eq!(registry.connections_for(bob.id).await.len(), 1);
}

#[tokio::test]
async fn roster_matches_identities_with_open_connections() {
    let registry = PresenceRegistry::new();
    let people: Vec<Identity> = (1..=4).map(|id| identity(id, &format!("user{id}"))).collect();
    let mut opened = Vec::new();
    let mut receivers = Vec::new();
    for person in people.iter().chain(people.iter().take(2)) {
        let (conn, tx, rx) = connection(person);
        opened.push((conn.connection_id, person.id));
        receivers.push(rx);
        registry.register(conn, tx).await;
    }

    // close both connections of user1 and the only connection of user3
    for (connection_id, user_id) in &opened {
        if *user_id == UserId(1) || *user_id == UserId(3) {
            registry.unregister(*connection_id).await;
        }
    }

    let roster: Vec<(UserId, usize)> = registry
        .roster()
        .await
        .into_iter()
        .map(|entry| (entry.identity, entry.connections))
        .collect();
    assert_eq!(roster, vec![(UserId(2), 2), (UserId(4), 1)]);
    assert_eq!(registry.all_connections().await.len(), 3);
    assert!(registry.connections_for(UserId(1)).await.is_empty());
}

#[tokio::test]
async fn dispatch_to_identities_reaches_each_connection_once() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let (conn, tx, mut rx) = connection(&alice);
    registry.register(conn, tx).await;
    drain(&mut rx);

    let delivered = registry
        .dispatch(
            &Audience::Identities(vec![alice.id, alice.id]),
            &ServerEvent::MessageRecalled {
                message_id: shared::domain::MessageId(1),
            },
        )
        .await;

    assert_eq!(delivered, 1);
    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test]
async fn dispatch_skips_closed_queues() {
    let registry = PresenceRegistry::new();
    let alice = identity(1, "alice");
    let (conn, tx, rx) = connection(&alice);
    registry.register(conn, tx).await;
    drop(rx);

    let delivered = registry
        .dispatch(
            &Audience::Everyone,
            &ServerEvent::UsersList(Vec::new()),
        )
        .await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn identity_stays_known_after_its_last_connection_closes() {
    let registry = PresenceRegistry::new();
    let bob = identity(2, "bob");
    let (conn, tx, _rx) = connection(&bob);
    let conn_id = conn.connection_id;
    registry.register(conn, tx).await;
    registry.unregister(conn_id).await;

    assert_eq!(registry.online_identity(bob.id).await, None);
    assert_eq!(registry.known_identity(bob.id).await, Some(bob));
    assert_eq!(registry.known_identity(UserId(3)).await, None);
}
