//! Table definitions for the gateway database.

use crate::Result;

const TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS channels (
        id            TEXT PRIMARY KEY,
        channel_type  TEXT NOT NULL UNIQUE,
        name          TEXT NOT NULL,
        enabled       INTEGER NOT NULL DEFAULT 0,
        config        TEXT NOT NULL DEFAULT '{}',
        security      TEXT NOT NULL DEFAULT '{}',
        status        TEXT NOT NULL DEFAULT 'disconnected',
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_users (
        id                 TEXT PRIMARY KEY,
        channel_id         TEXT NOT NULL,
        channel_user_id    TEXT NOT NULL,
        user_name          TEXT,
        allowed            INTEGER NOT NULL DEFAULT 0,
        pairing_code       TEXT,
        pairing_expires_at INTEGER,
        lockout_until      INTEGER,
        pairing_attempts   INTEGER NOT NULL DEFAULT 0,
        last_seen_at       INTEGER,
        created_at         INTEGER NOT NULL,
        UNIQUE(channel_id, channel_user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_sessions (
        id               TEXT PRIMARY KEY,
        channel_id       TEXT NOT NULL,
        chat_id          TEXT NOT NULL,
        workspace_id     TEXT,
        task_id          TEXT,
        state            TEXT NOT NULL DEFAULT 'idle',
        context          TEXT NOT NULL DEFAULT '{}',
        last_activity_at INTEGER NOT NULL,
        created_at       INTEGER NOT NULL,
        UNIQUE(channel_id, chat_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_messages (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id     TEXT NOT NULL,
        channel_type   TEXT NOT NULL,
        user_id        TEXT NOT NULL,
        user_name      TEXT,
        chat_id        TEXT NOT NULL,
        chat_type      TEXT NOT NULL,
        body           TEXT NOT NULL,
        access_granted INTEGER NOT NULL,
        created_at     INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tasks (
        id             TEXT PRIMARY KEY,
        parent_task_id TEXT,
        workspace_id   TEXT,
        title          TEXT NOT NULL,
        status         TEXT NOT NULL DEFAULT 'queued',
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS workspaces (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL UNIQUE,
        path       TEXT,
        created_at INTEGER NOT NULL
    )"#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_channel_users_code ON channel_users(channel_id, pairing_code)",
    "CREATE INDEX IF NOT EXISTS idx_channel_sessions_task ON channel_sessions(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_channel_messages_chat ON channel_messages(channel_id, chat_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id)",
];

/// Create all gateway tables and indexes if they do not exist.
pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
