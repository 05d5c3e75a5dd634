//! Channel endpoint configuration rows.

use {
    courier_common::{time::now_ms, types::SecurityConfig},
    serde::Serialize,
};

use crate::Result;

/// Connection state of a channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "connecting" => Self::Connecting,
            "connected" => Self::Connected,
            "error" => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

/// A configured protocol endpoint (one row per channel type).
#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub id: String,
    pub channel_type: String,
    pub name: String,
    pub enabled: bool,
    /// Adapter-specific configuration blob.
    pub config: serde_json::Value,
    pub security: SecurityConfig,
    pub status: ConnectionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    id: String,
    channel_type: String,
    name: String,
    enabled: bool,
    config: String,
    security: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl From<ChannelRow> for ChannelRecord {
    fn from(r: ChannelRow) -> Self {
        Self {
            id: r.id,
            channel_type: r.channel_type,
            name: r.name,
            enabled: r.enabled,
            config: serde_json::from_str(&r.config).unwrap_or_default(),
            security: serde_json::from_str(&r.security).unwrap_or_default(),
            status: ConnectionStatus::parse(&r.status),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

const SELECT: &str = "SELECT id, channel_type, name, enabled, config, security, status, \
                      created_at, updated_at FROM channels";

/// Repository for channel endpoint rows.
#[derive(Clone)]
pub struct ChannelRepo {
    pool: sqlx::SqlitePool,
}

impl ChannelRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<ChannelRecord>> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!("{SELECT} ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ChannelRecord>> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!("{SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_type(&self, channel_type: &str) -> Result<Option<ChannelRecord>> {
        let row = sqlx::query_as::<_, ChannelRow>(&format!("{SELECT} WHERE channel_type = ?"))
            .bind(channel_type)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Insert a channel, or update its name/config/security if the type is
    /// already configured.
    pub async fn upsert(
        &self,
        channel_type: &str,
        name: &str,
        config: &serde_json::Value,
        security: &SecurityConfig,
    ) -> Result<ChannelRecord> {
        let now = now_ms();
        sqlx::query(
            r#"INSERT INTO channels (id, channel_type, name, enabled, config, security, status,
                                     created_at, updated_at)
               VALUES (?, ?, ?, 0, ?, ?, 'disconnected', ?, ?)
               ON CONFLICT(channel_type) DO UPDATE SET
                 name = excluded.name,
                 config = excluded.config,
                 security = excluded.security,
                 updated_at = excluded.updated_at"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(channel_type)
        .bind(name)
        .bind(serde_json::to_string(config)?)
        .bind(serde_json::to_string(security)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_by_type(channel_type)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("channel {channel_type}")))
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE channels SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: ConnectionStatus) -> Result<()> {
        sqlx::query("UPDATE channels SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_common::types::AccessMode;

    use super::*;

    async fn repo() -> ChannelRepo {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        ChannelRepo::new(pool)
    }

    #[tokio::test]
    async fn upsert_creates_and_updates() {
        let repo = repo().await;
        let sec = SecurityConfig::default();
        let ch = repo
            .upsert("telegram", "Main bot", &serde_json::json!({"token": "t"}), &sec)
            .await
            .unwrap();
        assert_eq!(ch.channel_type, "telegram");
        assert!(!ch.enabled);
        assert_eq!(ch.status, ConnectionStatus::Disconnected);

        let sec2 = SecurityConfig {
            mode: AccessMode::Open,
            ..Default::default()
        };
        let updated = repo
            .upsert("telegram", "Renamed", &serde_json::json!({}), &sec2)
            .await
            .unwrap();
        // Same row, updated fields.
        assert_eq!(updated.id, ch.id);
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.security.mode, AccessMode::Open);
    }

    #[tokio::test]
    async fn enable_and_status() {
        let repo = repo().await;
        let ch = repo
            .upsert("signal", "Signal", &serde_json::json!({}), &SecurityConfig::default())
            .await
            .unwrap();
        repo.set_enabled(&ch.id, true).await.unwrap();
        repo.set_status(&ch.id, ConnectionStatus::Connected).await.unwrap();
        let ch = repo.get(&ch.id).await.unwrap().unwrap();
        assert!(ch.enabled);
        assert_eq!(ch.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn get_by_type_missing() {
        let repo = repo().await;
        assert!(repo.get_by_type("discord").await.unwrap().is_none());
    }
}
