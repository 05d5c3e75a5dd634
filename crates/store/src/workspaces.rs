//! Workspace rows selectable from chat commands.

use {courier_common::time::now_ms, serde::Serialize};

use crate::Result;

/// Name of the auto-assigned fallback workspace.
pub const TEMP_WORKSPACE_NAME: &str = "scratch";

/// A named workspace tasks can run in.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub path: Option<String>,
    pub created_at: i64,
}

/// Repository for workspace rows.
#[derive(Clone)]
pub struct WorkspaceRepo {
    pool: sqlx::SqlitePool,
}

impl WorkspaceRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceRecord>> {
        let rows = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT id, name, path, created_at FROM workspaces ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let row = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT id, name, path, created_at FROM workspaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<WorkspaceRecord>> {
        let row = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT id, name, path, created_at FROM workspaces WHERE name = ? COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert(&self, name: &str, path: Option<&str>) -> Result<WorkspaceRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO workspaces (id, name, path, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(path)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        self.get(&id)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("workspace {name}")))
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get or create the well-known temporary workspace.
    pub async fn ensure_temp(&self) -> Result<WorkspaceRecord> {
        if let Some(ws) = self.get_by_name(TEMP_WORKSPACE_NAME).await? {
            return Ok(ws);
        }
        self.insert(TEMP_WORKSPACE_NAME, None).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn repo() -> WorkspaceRepo {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        WorkspaceRepo::new(pool)
    }

    #[tokio::test]
    async fn name_lookup_is_case_insensitive() {
        let repo = repo().await;
        repo.insert("Website", Some("/srv/web")).await.unwrap();
        let found = repo.get_by_name("website").await.unwrap().unwrap();
        assert_eq!(found.name, "Website");
    }

    #[tokio::test]
    async fn ensure_temp_is_idempotent() {
        let repo = repo().await;
        let a = repo.ensure_temp().await.unwrap();
        let b = repo.ensure_temp().await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, TEMP_WORKSPACE_NAME);
    }

    #[tokio::test]
    async fn remove_missing_returns_false() {
        let repo = repo().await;
        assert!(!repo.remove("nope").await.unwrap());
    }
}
