use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{Content, Identity, MessageId},
    time::from_unix_millis,
};
use storage::Storage;

use super::*;
use crate::test_support::{identity, memory_store};

fn at(offset_secs: i64) -> DateTime<Utc> {
    from_unix_millis(1_700_000_000_000) + Duration::seconds(offset_secs)
}

async fn seed(
    store: &Storage,
    id: i64,
    sender: &Identity,
    recipient: Option<&Identity>,
    created_at: DateTime<Utc>,
) {
    store
        .insert_message(&StoredMessage {
            id: MessageId(id),
            sender: sender.clone(),
            recipient: recipient.cloned(),
            body: format!("message {id}"),
            content: Content::Text,
            created_at,
        })
        .await
        .expect("insert");
}

fn ids(messages: &[MessagePayload]) -> Vec<i64> {
    messages.iter().map(|message| message.id.0).collect()
}

#[tokio::test]
async fn group_history_returns_newest_window_oldest_first() {
    let store = Arc::new(memory_store().await);
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    for id in 1..=5 {
        seed(&store, id, &alice, None, at(id)).await;
    }
    seed(&store, 6, &alice, Some(&bob), at(6)).await;

    let history = HistoryService::new(store.clone());
    let recent = history.group_history(Some(3)).await.expect("history");
    assert_eq!(ids(&recent), vec![3, 4, 5]);
    assert!(recent.iter().all(|message| !message.is_private));

    let limited = history.with_limits(2, 10);
    assert_eq!(ids(&limited.group_history(None).await.expect("history")), vec![4, 5]);
}

#[tokio::test]
async fn private_history_is_scoped_to_the_pair() {
    let store = Arc::new(memory_store().await);
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let carol = identity(3, "carol");
    seed(&store, 1, &alice, Some(&bob), at(1)).await;
    seed(&store, 2, &bob, Some(&alice), at(2)).await;
    seed(&store, 3, &alice, Some(&carol), at(3)).await;
    seed(&store, 4, &carol, None, at(4)).await;

    let history = HistoryService::new(store.clone());
    let from_alice = history
        .private_history(alice.id, bob.id, None)
        .await
        .expect("history");
    let from_bob = history
        .private_history(bob.id, alice.id, None)
        .await
        .expect("history");
    assert_eq!(ids(&from_alice), vec![1, 2]);
    assert_eq!(from_alice, from_bob);
    assert!(from_alice.iter().all(|message| message.is_private));

    let carol_with_bob = history
        .private_history(carol.id, bob.id, None)
        .await
        .expect("history");
    assert!(carol_with_bob.is_empty());
}

#[tokio::test]
async fn threads_are_ordered_by_latest_activity() {
    let store = Arc::new(memory_store().await);
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let carol = identity(3, "carol");
    let dave = identity(4, "dave");
    seed(&store, 1, &alice, Some(&bob), at(10)).await;
    seed(&store, 2, &carol, Some(&alice), at(20)).await;
    seed(&store, 3, &bob, Some(&alice), at(30)).await;
    seed(&store, 4, &carol, Some(&dave), at(40)).await;

    let threads = HistoryService::new(store.clone())
        .private_threads_for(alice.id)
        .await
        .expect("threads");
    assert_eq!(
        threads,
        vec![
            ThreadSummary {
                other_identity: bob.id,
                other_display_name: "bob".into(),
                last_message_at: at(30),
            },
            ThreadSummary {
                other_identity: carol.id,
                other_display_name: "carol".into(),
                last_message_at: at(20),
            },
        ]
    );
}

#[test]
fn render_marks_direct_messages_private() {
    let alice = identity(1, "alice");
    let bob = identity(2, "bob");
    let stored = StoredMessage {
        id: MessageId(9),
        sender: alice.clone(),
        recipient: Some(bob.clone()),
        body: "hi".into(),
        content: Content::Text,
        created_at: at(0),
    };

    let rendered = render(&stored);
    assert!(rendered.is_private);
    assert_eq!(rendered.recipient_identity, Some(bob));
    assert_eq!(rendered.sender_identity, alice);
    assert_eq!(rendered.created_at, stored.created_at);
}
