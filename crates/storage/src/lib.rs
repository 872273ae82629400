use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use thiserror::Error;
use tracing::{info, warn};

use shared::{
    domain::{Attachment, Channel, Content, Identity, MessageId, MessageKind, UserId},
    time::{from_unix_millis, to_unix_millis},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row for message {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: Identity,
    pub recipient: Option<Identity>,
    pub body: String,
    pub content: Content,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn channel(&self) -> Channel {
        match &self.recipient {
            Some(recipient) => Channel::Direct(recipient.id),
            None => Channel::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredThread {
    pub other: Identity,
    pub last_message_at: DateTime<Utc>,
}

/// Persisted message store consumed by the coordinator.
///
/// Ids are handed out by the caller from [`MessageStore::next_message_id`]
/// onwards; the store never reissues an id, even after the row is deleted.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn next_message_id(&self) -> StoreResult<MessageId>;

    async fn insert_message(&self, message: &StoredMessage) -> StoreResult<()>;

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<StoredMessage>>;

    /// Hard delete. Returns `false` when no row had that id.
    async fn delete_message(&self, id: MessageId) -> StoreResult<bool>;

    /// Newest `limit` group messages, oldest first.
    async fn recent_group_messages(&self, limit: u32) -> StoreResult<Vec<StoredMessage>>;

    /// Newest `limit` direct messages between `a` and `b`, oldest first.
    async fn private_messages(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Conversation partners of `user`, most recent activity first.
    async fn private_threads(&self, user: UserId) -> StoreResult<Vec<StoredThread>>;

    async fn display_name_for(&self, user: UserId) -> StoreResult<Option<String>>;
}

macro_rules! select_messages {
    ($tail:literal) => {
        concat!(
            "SELECT id, sender_id, sender_name, recipient_id, recipient_name, body, kind,
                    attachment_url, attachment_name, attachment_size_bytes, attachment_mime_type,
                    created_at_ms
             FROM messages ",
            $tail
        )
    };
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    call_timeout: Duration,
}

impl Storage {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to `sqlite::memory:` would otherwise see its own database
        let max_connections = if is_in_memory(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections, "message store ready");
        Ok(Self {
            pool,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        let _: i64 = self
            .timed(sqlx::query_scalar("SELECT 1").fetch_one(&self.pool))
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "store call timed out");
                Err(StoreError::Timeout(self.call_timeout))
            }
        }
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn next_message_id(&self) -> StoreResult<MessageId> {
        // sqlite_sequence remembers ids of deleted rows, MAX(id) covers explicit inserts.
        let next: i64 = self
            .timed(
                sqlx::query_scalar(
                    "SELECT MAX(
                        COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'messages'), 0),
                        COALESCE((SELECT MAX(id) FROM messages), 0)
                     ) + 1",
                )
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(MessageId(next))
    }

    async fn insert_message(&self, message: &StoredMessage) -> StoreResult<()> {
        let attachment = message.content.attachment();
        self.timed(
            sqlx::query(
                "INSERT INTO messages (id, sender_id, sender_name, recipient_id, recipient_name, body, kind, attachment_url, attachment_name, attachment_size_bytes, attachment_mime_type, created_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id.0)
            .bind(message.sender.id.0)
            .bind(message.sender.display_name.as_str())
            .bind(message.recipient.as_ref().map(|r| r.id.0))
            .bind(message.recipient.as_ref().map(|r| r.display_name.as_str()))
            .bind(message.body.as_str())
            .bind(message.content.kind().as_str())
            .bind(attachment.map(|a| a.url.as_str()))
            .bind(attachment.map(|a| a.name.as_str()))
            .bind(attachment.map(|a| i64::try_from(a.size_bytes).unwrap_or(i64::MAX)))
            .bind(attachment.and_then(|a| a.mime_type.as_deref()))
            .bind(to_unix_millis(message.created_at))
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<StoredMessage>> {
        let row = self
            .timed(
                sqlx::query(select_messages!("WHERE id = ?"))
                    .bind(id.0)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn delete_message(&self, id: MessageId) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM messages WHERE id = ?")
                    .bind(id.0)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recent_group_messages(&self, limit: u32) -> StoreResult<Vec<StoredMessage>> {
        let mut rows = self
            .timed(
                sqlx::query(select_messages!(
                    "WHERE recipient_id IS NULL
                     ORDER BY created_at_ms DESC, id DESC
                     LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    async fn private_messages(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>> {
        let mut rows = self
            .timed(
                sqlx::query(select_messages!(
                    "WHERE (sender_id = ? AND recipient_id = ?)
                        OR (sender_id = ? AND recipient_id = ?)
                     ORDER BY created_at_ms DESC, id DESC
                     LIMIT ?"
                ))
                .bind(a.0)
                .bind(b.0)
                .bind(b.0)
                .bind(a.0)
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    async fn private_threads(&self, user: UserId) -> StoreResult<Vec<StoredThread>> {
        // SQLite takes bare columns next to MAX() from the row holding the maximum,
        // so other_name is the partner's most recently recorded display name.
        let rows = self
            .timed(
                sqlx::query(
                    "SELECT other_id, other_name, MAX(created_at_ms) AS last_at
                     FROM (
                         SELECT recipient_id AS other_id, recipient_name AS other_name, created_at_ms
                         FROM messages
                         WHERE sender_id = ? AND recipient_id IS NOT NULL
                         UNION ALL
                         SELECT sender_id AS other_id, sender_name AS other_name, created_at_ms
                         FROM messages
                         WHERE recipient_id = ?
                     )
                     GROUP BY other_id
                     ORDER BY last_at DESC, other_id ASC",
                )
                .bind(user.0)
                .bind(user.0)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredThread {
                other: Identity::new(
                    UserId(r.get::<i64, _>(0)),
                    r.get::<Option<String>, _>(1).unwrap_or_default(),
                ),
                last_message_at: from_unix_millis(r.get::<i64, _>(2)),
            })
            .collect())
    }

    async fn display_name_for(&self, user: UserId) -> StoreResult<Option<String>> {
        let row = self
            .timed(
                sqlx::query(
                    "SELECT name FROM (
                         SELECT sender_name AS name, created_at_ms, id FROM messages WHERE sender_id = ?
                         UNION ALL
                         SELECT recipient_name AS name, created_at_ms, id FROM messages WHERE recipient_id = ?
                     )
                     ORDER BY created_at_ms DESC, id DESC
                     LIMIT 1",
                )
                .bind(user.0)
                .bind(user.0)
                .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }
}

fn message_from_row(r: &SqliteRow) -> StoreResult<StoredMessage> {
    let id = r.get::<i64, _>(0);
    let kind_raw = r.get::<String, _>(6);
    let kind = MessageKind::parse(&kind_raw).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown kind '{kind_raw}'"),
    })?;

    let attachment = r.get::<Option<String>, _>(7).map(|url| Attachment {
        url,
        name: r
            .get::<Option<String>, _>(8)
            .unwrap_or_else(|| "attachment.bin".to_string()),
        size_bytes: r.get::<Option<i64>, _>(9).unwrap_or_default().max(0) as u64,
        mime_type: r.get::<Option<String>, _>(10),
    });

    let content = match (kind, attachment) {
        (MessageKind::Text, _) => Content::Text,
        (MessageKind::Image, Some(attachment)) => Content::Image { attachment },
        (MessageKind::File, Some(attachment)) => Content::File { attachment },
        (_, None) => {
            return Err(StoreError::Corrupt {
                id,
                reason: format!("{kind_raw} message without attachment"),
            })
        }
    };

    let recipient = r
        .get::<Option<i64>, _>(3)
        .map(|recipient_id| {
            Identity::new(
                UserId(recipient_id),
                r.get::<Option<String>, _>(4).unwrap_or_default(),
            )
        });

    Ok(StoredMessage {
        id: MessageId(id),
        sender: Identity::new(UserId(r.get::<i64, _>(1)), r.get::<String, _>(2)),
        recipient,
        body: r.get::<String, _>(5),
        content,
        created_at: from_unix_millis(r.get::<i64, _>(11)),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> StoreResult<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent)?;
    Ok(())
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
