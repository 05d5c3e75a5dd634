//! Persistent log of every inbound message, allowed or not.

use courier_common::time::now_ms;

use crate::Result;

/// A single logged inbound message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageLogEntry {
    pub id: i64,
    pub channel_id: String,
    pub channel_type: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub chat_id: String,
    pub chat_type: String,
    pub body: String,
    pub access_granted: bool,
    pub created_at: i64,
}

/// Fields needed to append a log entry.
#[derive(Debug, Clone)]
pub struct NewMessageLogEntry {
    pub channel_id: String,
    pub channel_type: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub chat_id: String,
    pub chat_type: String,
    pub body: String,
    pub access_granted: bool,
}

/// Repository for the inbound message log.
#[derive(Clone)]
pub struct MessageLogRepo {
    pool: sqlx::SqlitePool,
}

impl MessageLogRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, entry: NewMessageLogEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO channel_messages (channel_id, channel_type, user_id, user_name,
                                             chat_id, chat_type, body, access_granted, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.channel_id)
        .bind(&entry.channel_type)
        .bind(&entry.user_id)
        .bind(&entry.user_name)
        .bind(&entry.chat_id)
        .bind(&entry.chat_type)
        .bind(&entry.body)
        .bind(entry.access_granted)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries for one chat, newest first.
    pub async fn list_by_chat(
        &self,
        channel_id: &str,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageLogEntry>> {
        let rows = sqlx::query_as::<_, MessageLogEntry>(
            "SELECT id, channel_id, channel_type, user_id, user_name, chat_id, chat_type, body, \
             access_granted, created_at FROM channel_messages \
             WHERE channel_id = ? AND chat_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(channel_id)
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
