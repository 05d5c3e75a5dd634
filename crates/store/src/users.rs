//! Per-channel sender identity rows, including pairing state.

use {courier_common::time::now_ms, serde::Serialize};

use crate::Result;

/// Prefix used for synthetic rows that hold an unclaimed pairing code.
pub const PLACEHOLDER_PREFIX: &str = "pairing:";

/// Identity of a sender scoped to one channel.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChannelUserRecord {
    pub id: String,
    pub channel_id: String,
    pub channel_user_id: String,
    pub user_name: Option<String>,
    pub allowed: bool,
    pub pairing_code: Option<String>,
    /// Epoch ms at which a stored pairing code stops being redeemable.
    pub pairing_expires_at: Option<i64>,
    /// Epoch ms until which this sender is locked out of verification.
    pub lockout_until: Option<i64>,
    pub pairing_attempts: i64,
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
}

impl ChannelUserRecord {
    /// True for synthetic rows that only exist to hold an unclaimed code.
    pub fn is_placeholder(&self) -> bool {
        self.channel_user_id.starts_with(PLACEHOLDER_PREFIX)
    }
}

const SELECT: &str = "SELECT id, channel_id, channel_user_id, user_name, allowed, pairing_code, \
                      pairing_expires_at, lockout_until, pairing_attempts, last_seen_at, \
                      created_at FROM channel_users";

/// Repository for channel user rows.
#[derive(Clone)]
pub struct ChannelUserRepo {
    pool: sqlx::SqlitePool,
}

impl ChannelUserRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensure a row exists for `(channel_id, channel_user_id)` and return it.
    /// A fresh row is created with `allowed = allowed_default`; an existing
    /// row only has its user name refreshed.
    pub async fn upsert(
        &self,
        channel_id: &str,
        channel_user_id: &str,
        user_name: Option<&str>,
        allowed_default: bool,
    ) -> Result<ChannelUserRecord> {
        sqlx::query(
            r#"INSERT INTO channel_users (id, channel_id, channel_user_id, user_name, allowed,
                                          pairing_attempts, created_at)
               VALUES (?, ?, ?, ?, ?, 0, ?)
               ON CONFLICT(channel_id, channel_user_id) DO UPDATE SET
                 user_name = COALESCE(excluded.user_name, channel_users.user_name)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(channel_id)
        .bind(channel_user_id)
        .bind(user_name)
        .bind(allowed_default)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.get(channel_id, channel_user_id)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("channel user {channel_user_id}")))
    }

    pub async fn get(
        &self,
        channel_id: &str,
        channel_user_id: &str,
    ) -> Result<Option<ChannelUserRecord>> {
        let row = sqlx::query_as::<_, ChannelUserRecord>(&format!(
            "{SELECT} WHERE channel_id = ? AND channel_user_id = ?"
        ))
        .bind(channel_id)
        .bind(channel_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_by_channel(&self, channel_id: &str) -> Result<Vec<ChannelUserRecord>> {
        let rows = sqlx::query_as::<_, ChannelUserRecord>(&format!(
            "{SELECT} WHERE channel_id = ? ORDER BY created_at"
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Create a synthetic placeholder row holding an unclaimed pairing code.
    pub async fn insert_placeholder(
        &self,
        channel_id: &str,
        code: &str,
        expires_at: i64,
    ) -> Result<ChannelUserRecord> {
        let channel_user_id = format!("{PLACEHOLDER_PREFIX}{}", uuid::Uuid::new_v4());
        sqlx::query(
            r#"INSERT INTO channel_users (id, channel_id, channel_user_id, allowed, pairing_code,
                                          pairing_expires_at, pairing_attempts, created_at)
               VALUES (?, ?, ?, 0, ?, ?, 0, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(channel_id)
        .bind(&channel_user_id)
        .bind(code)
        .bind(expires_at)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.get(channel_id, &channel_user_id)
            .await?
            .ok_or_else(|| crate::Error::not_found("pairing placeholder"))
    }

    /// Find the row holding `code` anywhere in the channel, case-insensitively.
    pub async fn find_by_code(
        &self,
        channel_id: &str,
        code: &str,
    ) -> Result<Option<ChannelUserRecord>> {
        let row = sqlx::query_as::<_, ChannelUserRecord>(&format!(
            "{SELECT} WHERE channel_id = ? AND pairing_code IS NOT NULL \
             AND UPPER(pairing_code) = UPPER(?)"
        ))
        .bind(channel_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Clear a stored pairing code (and its expiry) from a row.
    pub async fn clear_pairing_code(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE channel_users SET pairing_code = NULL, pairing_expires_at = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a sender allowed and reset all pairing counters.
    pub async fn grant(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE channel_users SET allowed = 1, pairing_code = NULL,
               pairing_expires_at = NULL, lockout_until = NULL, pairing_attempts = 0
               WHERE id = ?"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Revoke a sender's access.
    pub async fn revoke(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE channel_users SET allowed = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed verification attempt, optionally arming a lockout.
    pub async fn record_failed_attempt(
        &self,
        id: &str,
        attempts: i64,
        lockout_until: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE channel_users SET pairing_attempts = ?, lockout_until = ? WHERE id = ?")
            .bind(attempts)
            .bind(lockout_until)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reset the attempt counter and lockout after the window elapses.
    pub async fn reset_attempts(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE channel_users SET pairing_attempts = 0, lockout_until = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE channel_users SET last_seen_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete expired unclaimed placeholder rows. Returns the count removed.
    pub async fn delete_expired_placeholders(&self, channel_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM channel_users WHERE channel_id = ? AND channel_user_id LIKE ? \
             AND pairing_expires_at IS NOT NULL AND pairing_expires_at < ?",
        )
        .bind(channel_id)
        .bind(format!("{PLACEHOLDER_PREFIX}%"))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn repo() -> ChannelUserRepo {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        ChannelUserRepo::new(pool)
    }

    #[tokio::test]
    async fn upsert_preserves_allowed_flag() {
        let repo = repo().await;
        let user = repo.upsert("ch1", "u1", Some("Alice"), false).await.unwrap();
        assert!(!user.allowed);

        repo.grant(&user.id).await.unwrap();
        // A later upsert must not reset the allowed flag.
        let again = repo.upsert("ch1", "u1", None, false).await.unwrap();
        assert!(again.allowed);
        assert_eq!(again.user_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn find_by_code_is_case_insensitive() {
        let repo = repo().await;
        let placeholder = repo
            .insert_placeholder("ch1", "AB12CD", now_ms() + 60_000)
            .await
            .unwrap();
        assert!(placeholder.is_placeholder());

        let found = repo.find_by_code("ch1", "ab12cd").await.unwrap().unwrap();
        assert_eq!(found.id, placeholder.id);
        // Wrong channel does not match.
        assert!(repo.find_by_code("ch2", "AB12CD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_clears_pairing_state() {
        let repo = repo().await;
        let user = repo.upsert("ch1", "u1", None, false).await.unwrap();
        repo.record_failed_attempt(&user.id, 3, Some(now_ms() + 1000))
            .await
            .unwrap();
        repo.grant(&user.id).await.unwrap();

        let user = repo.get("ch1", "u1").await.unwrap().unwrap();
        assert!(user.allowed);
        assert_eq!(user.pairing_attempts, 0);
        assert!(user.lockout_until.is_none());
    }

    #[tokio::test]
    async fn expired_placeholders_are_swept() {
        let repo = repo().await;
        repo.insert_placeholder("ch1", "OLD123", now_ms() - 1000)
            .await
            .unwrap();
        repo.insert_placeholder("ch1", "NEW456", now_ms() + 60_000)
            .await
            .unwrap();
        // Real users with expired codes are not placeholders and survive.
        let user = repo.upsert("ch1", "u1", None, false).await.unwrap();
        assert!(!user.is_placeholder());

        let removed = repo.delete_expired_placeholders("ch1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.find_by_code("ch1", "NEW456").await.unwrap().is_some());
        assert!(repo.get("ch1", "u1").await.unwrap().is_some());
    }
}
