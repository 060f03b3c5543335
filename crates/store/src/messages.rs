//! Message store.
//!
//! Rows are keyed by `(instance_id, chat_id, message_id)`; writes are
//! insert-if-absent so the live event path and the history sync worker can
//! deliver the same message any number of times.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::warn,
    wagate_common::MediaKind,
};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub instance_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub owner_id: String,
    pub body: Option<String>,
    pub media_type: Option<MediaKind>,
    pub media_path: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub from_me: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns `true` if a row was written, `false` if the key already existed.
    async fn insert_if_absent(&self, msg: &MessageRecord) -> Result<bool>;

    /// Messages of one chat, oldest first.
    async fn list_chat(&self, instance_id: &str, chat_id: &str) -> Result<Vec<MessageRecord>>;

    async fn count(&self, instance_id: &str) -> Result<u64>;
}

/// SQLite-backed message store.
pub struct SqliteMessageStore {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    instance_id: String,
    chat_id: String,
    message_id: String,
    sender_id: String,
    owner_id: String,
    body: Option<String>,
    media_type: Option<String>,
    media_path: Option<String>,
    timestamp: i64,
    from_me: bool,
}

impl From<MessageRow> for MessageRecord {
    fn from(r: MessageRow) -> Self {
        let media_type = r.media_type.and_then(|m| match m.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                warn!(message_id = %r.message_id, error = %e, "ignoring stored media type");
                None
            },
        });
        Self {
            instance_id: r.instance_id,
            chat_id: r.chat_id,
            message_id: r.message_id,
            sender_id: r.sender_id,
            owner_id: r.owner_id,
            body: r.body,
            media_type,
            media_path: r.media_path,
            timestamp: r.timestamp,
            from_me: r.from_me,
        }
    }
}

impl SqliteMessageStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `messages` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                chat_id     TEXT NOT NULL,
                message_id  TEXT NOT NULL,
                sender_id   TEXT NOT NULL,
                owner_id    TEXT NOT NULL,
                body        TEXT,
                media_type  TEXT,
                media_path  TEXT,
                timestamp   INTEGER NOT NULL,
                from_me     INTEGER NOT NULL DEFAULT 0,
                UNIQUE (instance_id, chat_id, message_id)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (instance_id, chat_id, timestamp)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert_if_absent(&self, msg: &MessageRecord) -> Result<bool> {
        let done = sqlx::query(
            r#"INSERT INTO messages (
                 instance_id, chat_id, message_id, sender_id, owner_id,
                 body, media_type, media_path, timestamp, from_me)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, chat_id, message_id) DO NOTHING"#,
        )
        .bind(&msg.instance_id)
        .bind(&msg.chat_id)
        .bind(&msg.message_id)
        .bind(&msg.sender_id)
        .bind(&msg.owner_id)
        .bind(&msg.body)
        .bind(msg.media_type.map(|m| m.as_str()))
        .bind(&msg.media_path)
        .bind(msg.timestamp)
        .bind(msg.from_me)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn list_chat(&self, instance_id: &str, chat_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"SELECT instance_id, chat_id, message_id, sender_id, owner_id,
                      body, media_type, media_path, timestamp, from_me
               FROM messages
               WHERE instance_id = ? AND chat_id = ?
               ORDER BY timestamp ASC, id ASC"#,
        )
        .bind(instance_id)
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count(&self, instance_id: &str) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
