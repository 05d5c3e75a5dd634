//! Conversation session rows: one per `(channel, chat)`.

use {courier_common::time::now_ms, serde::Serialize};

use crate::Result;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Active,
    WaitingApproval,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::WaitingApproval => "waiting_approval",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "waiting_approval" => Self::WaitingApproval,
            _ => Self::Idle,
        }
    }
}

/// Durable state of one conversation within a channel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub channel_id: String,
    pub chat_id: String,
    pub workspace_id: Option<String>,
    pub task_id: Option<String>,
    pub state: SessionState,
    /// Freeform context map (last sender, pending selection, …).
    pub context: serde_json::Value,
    pub last_activity_at: i64,
    pub created_at: i64,
}

impl SessionRecord {
    /// Read a string value out of the context map.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    channel_id: String,
    chat_id: String,
    workspace_id: Option<String>,
    task_id: Option<String>,
    state: String,
    context: String,
    last_activity_at: i64,
    created_at: i64,
}

impl From<SessionRow> for SessionRecord {
    fn from(r: SessionRow) -> Self {
        Self {
            id: r.id,
            channel_id: r.channel_id,
            chat_id: r.chat_id,
            workspace_id: r.workspace_id,
            task_id: r.task_id,
            state: SessionState::parse(&r.state),
            context: serde_json::from_str(&r.context)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            last_activity_at: r.last_activity_at,
            created_at: r.created_at,
        }
    }
}

const SELECT: &str = "SELECT id, channel_id, chat_id, workspace_id, task_id, state, context, \
                      last_activity_at, created_at FROM channel_sessions";

/// Repository for session rows.
#[derive(Clone)]
pub struct SessionRepo {
    pool: sqlx::SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_chat(
        &self,
        channel_id: &str,
        chat_id: &str,
    ) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT} WHERE channel_id = ? AND chat_id = ?"
        ))
        .bind(channel_id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn create(
        &self,
        channel_id: &str,
        chat_id: &str,
        workspace_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            r#"INSERT INTO channel_sessions (id, channel_id, chat_id, workspace_id, state,
                                             context, last_activity_at, created_at)
               VALUES (?, ?, ?, ?, 'idle', '{}', ?, ?)"#,
        )
        .bind(&id)
        .bind(channel_id)
        .bind(chat_id)
        .bind(workspace_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| crate::Error::not_found("session just created"))
    }

    /// Find the session currently linked to `task_id`.
    pub async fn find_by_task(&self, task_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT} WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// All sessions of a channel that are linked to some task.
    pub async fn list_linked(&self, channel_id: &str) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT} WHERE channel_id = ? AND task_id IS NOT NULL"
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn link_task(&self, id: &str, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE channel_sessions SET task_id = ?, state = 'active', last_activity_at = ? \
             WHERE id = ?",
        )
        .bind(task_id)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unlink_task(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE channel_sessions SET task_id = NULL, state = 'idle', last_activity_at = ? \
             WHERE id = ?",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_workspace(&self, id: &str, workspace_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE channel_sessions SET workspace_id = ?, last_activity_at = ? WHERE id = ?")
            .bind(workspace_id)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_state(&self, id: &str, state: SessionState) -> Result<()> {
        sqlx::query("UPDATE channel_sessions SET state = ?, last_activity_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE channel_sessions SET last_activity_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Shallow-merge `patch` into the context map. Top-level `null` values
    /// remove the key.
    pub async fn merge_context(&self, id: &str, patch: &serde_json::Value) -> Result<SessionRecord> {
        let session = self
            .get(id)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("session {id}")))?;

        let mut context = match session.context {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        if let serde_json::Value::Object(patch) = patch {
            for (key, value) in patch {
                if value.is_null() {
                    context.remove(key);
                } else {
                    context.insert(key.clone(), value.clone());
                }
            }
        }

        sqlx::query("UPDATE channel_sessions SET context = ?, last_activity_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&context)?)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.get(id)
            .await?
            .ok_or_else(|| crate::Error::not_found(format!("session {id}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn repo() -> SessionRepo {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::schema::init(&pool).await.unwrap();
        SessionRepo::new(pool)
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let repo = repo().await;
        let session = repo.create("ch1", "chat1", None).await.unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.task_id.is_none());

        let found = repo.get_by_chat("ch1", "chat1").await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn link_and_unlink_task() {
        let repo = repo().await;
        let session = repo.create("ch1", "chat1", None).await.unwrap();

        repo.link_task(&session.id, "task-1").await.unwrap();
        let session = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.task_id.as_deref(), Some("task-1"));
        assert_eq!(
            repo.find_by_task("task-1").await.unwrap().unwrap().id,
            session.id
        );

        repo.unlink_task(&session.id).await.unwrap();
        let session = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.task_id.is_none());
    }

    #[tokio::test]
    async fn merge_context_is_shallow() {
        let repo = repo().await;
        let session = repo.create("ch1", "chat1", None).await.unwrap();

        repo.merge_context(
            &session.id,
            &serde_json::json!({"last_user_id": "u1", "pending_selection": {"kind": "workspace"}}),
        )
        .await
        .unwrap();

        // Unrelated keys survive, null deletes.
        let merged = repo
            .merge_context(
                &session.id,
                &serde_json::json!({"last_user_id": "u2", "pending_selection": null}),
            )
            .await
            .unwrap();
        assert_eq!(merged.context_str("last_user_id"), Some("u2"));
        assert!(merged.context.get("pending_selection").is_none());
    }

    #[tokio::test]
    async fn list_linked_filters_unlinked() {
        let repo = repo().await;
        let a = repo.create("ch1", "chat-a", None).await.unwrap();
        let _b = repo.create("ch1", "chat-b", None).await.unwrap();
        repo.link_task(&a.id, "task-1").await.unwrap();

        let linked = repo.list_linked("ch1").await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, a.id);
    }
}
