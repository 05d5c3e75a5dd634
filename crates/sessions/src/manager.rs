use tracing::{debug, info};

use courier_store::sessions::{SessionRecord, SessionRepo, SessionState};

use crate::Result;

/// Maps `(channel, chat)` to a durable session record.
///
/// Sessions are only mutated by the single router instance processing one
/// message at a time per chat, so the backing store's atomic row updates are
/// the only concurrency control needed here.
#[derive(Clone)]
pub struct SessionManager {
    sessions: SessionRepo,
}

impl SessionManager {
    pub fn new(sessions: SessionRepo) -> Self {
        Self { sessions }
    }

    /// Look up the session for `(channel_id, chat_id)`, creating it lazily
    /// on the first message from a chat.
    pub async fn get_or_create(
        &self,
        channel_id: &str,
        chat_id: &str,
        default_workspace_id: Option<&str>,
    ) -> Result<SessionRecord> {
        if let Some(session) = self.sessions.get_by_chat(channel_id, chat_id).await? {
            self.sessions.touch(&session.id).await?;
            return Ok(session);
        }
        let session = self
            .sessions
            .create(channel_id, chat_id, default_workspace_id)
            .await?;
        info!(channel_id, chat_id, session_id = %session.id, "session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(session_id).await?)
    }

    pub async fn find_by_task(&self, task_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.find_by_task(task_id).await?)
    }

    /// Sessions of a channel still linked to a task (restart recovery).
    pub async fn list_linked(&self, channel_id: &str) -> Result<Vec<SessionRecord>> {
        Ok(self.sessions.list_linked(channel_id).await?)
    }

    /// Bind a session to a running task and mark it active.
    pub async fn link_task(&self, session_id: &str, task_id: &str) -> Result<()> {
        self.sessions.link_task(session_id, task_id).await?;
        debug!(session_id, task_id, "session linked to task");
        Ok(())
    }

    /// Detach a session from its task and return it to idle.
    pub async fn unlink_task(&self, session_id: &str) -> Result<()> {
        self.sessions.unlink_task(session_id).await?;
        debug!(session_id, "session unlinked from task");
        Ok(())
    }

    pub async fn set_workspace(&self, session_id: &str, workspace_id: Option<&str>) -> Result<()> {
        self.sessions.set_workspace(session_id, workspace_id).await?;
        Ok(())
    }

    pub async fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        self.sessions.set_state(session_id, state).await?;
        Ok(())
    }

    /// Shallow-merge `patch` into the session's freeform context map.
    pub async fn update_context(
        &self,
        session_id: &str,
        patch: serde_json::Value,
    ) -> Result<SessionRecord> {
        Ok(self.sessions.merge_context(session_id, &patch).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_store::schema;

    use super::*;

    async fn manager() -> SessionManager {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        schema::init(&pool).await.unwrap();
        SessionManager::new(SessionRepo::new(pool))
    }

    #[tokio::test]
    async fn get_or_create_is_lazy_and_stable() {
        let mgr = manager().await;
        let a = mgr.get_or_create("ch1", "chat1", Some("w1")).await.unwrap();
        let b = mgr.get_or_create("ch1", "chat1", None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.workspace_id.as_deref(), Some("w1"));
        // A different chat gets its own session.
        let c = mgr.get_or_create("ch1", "chat2", None).await.unwrap();
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn task_linking_drives_state() {
        let mgr = manager().await;
        let session = mgr.get_or_create("ch1", "chat1", None).await.unwrap();

        mgr.link_task(&session.id, "t1").await.unwrap();
        let session = mgr.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Active);

        mgr.set_state(&session.id, SessionState::WaitingApproval).await.unwrap();
        let session = mgr.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::WaitingApproval);

        mgr.unlink_task(&session.id).await.unwrap();
        let session = mgr.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.task_id.is_none());
    }

    #[tokio::test]
    async fn context_remembers_requester() {
        let mgr = manager().await;
        let session = mgr.get_or_create("ch1", "chat1", None).await.unwrap();
        let session = mgr
            .update_context(
                &session.id,
                serde_json::json!({
                    "task_requester_id": "u1",
                    "task_requester_name": "Alice",
                }),
            )
            .await
            .unwrap();
        assert_eq!(session.context_str("task_requester_id"), Some("u1"));
        assert_eq!(session.context_str("task_requester_name"), Some("Alice"));
    }
}
