//! Task rows mirrored from the task engine, used for route recovery and
//! parent-chain approval routing.

use {courier_common::time::now_ms, serde::Serialize};

use crate::Result;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "waiting_approval" => Self::WaitingApproval,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    /// Completed, failed, and cancelled tasks accept no further input.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A task known to the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub parent_task_id: Option<String>,
    pub workspace_id: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    parent_task_id: Option<String>,
    workspace_id: Option<String>,
    title: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl From<TaskRow> for TaskRecord {
    fn from(r: TaskRow) -> Self {
        Self {
            id: r.id,
            parent_task_id: r.parent_task_id,
            workspace_id: r.workspace_id,
            title: r.title,
            status: TaskStatus::parse(&r.status),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

const SELECT: &str =
    "SELECT id, parent_task_id, workspace_id, title, status, created_at, updated_at FROM tasks";

/// Repository for task rows.
#[derive(Clone)]
pub struct TaskRepo {
    pool: sqlx::SqlitePool,
}

impl TaskRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        id: &str,
        parent_task_id: Option<&str>,
        workspace_id: Option<&str>,
        title: &str,
    ) -> Result<TaskRecord> {
        let now = now_ms();
        sqlx::query(
            r#"INSERT INTO tasks (id, parent_task_id, workspace_id, title, status,
                                  created_at, updated_at)
               VALUES (?, ?, ?, ?, 'queued', ?, ?)"#,
        )
        .bind(id)
        .bind(parent_task_id)
        .bind(workspace_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("task {id}")))
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("{SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
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
    use super::*;

    #[tokio::test]
    async fn insert_and_transition() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        let repo = TaskRepo::new(pool);

        let task = repo.insert("t1", None, Some("w1"), "Build a report").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(!task.status.is_terminal());

        repo.set_status("t1", TaskStatus::Completed).await.unwrap();
        let task = repo.get("t1").await.unwrap().unwrap();
        assert!(task.status.is_terminal());
    }

    #[tokio::test]
    async fn parent_edge_is_stored() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        let repo = TaskRepo::new(pool);

        repo.insert("root", None, None, "root").await.unwrap();
        let child = repo.insert("child", Some("root"), None, "child").await.unwrap();
        assert_eq!(child.parent_task_id.as_deref(), Some("root"));
    }
}
