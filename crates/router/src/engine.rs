//! Contract with the backing task engine.
//!
//! The engine itself (prompt building, LLM calls, tool execution) is an
//! external collaborator; the gateway only starts/cancels tasks, forwards
//! follow-up text, answers approvals, and consumes the event stream.

use {async_trait::async_trait, serde::Serialize};

/// A task the gateway asks the engine to run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    pub id: String,
    pub workspace_id: Option<String>,
    /// Short human-readable title derived from the first message.
    pub title: String,
    /// Full prompt text.
    pub prompt: String,
    /// Preferred provider/model, when the chat selected one.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// True for `/shell` requests.
    pub shell: bool,
}

/// An approval raised by a running task (tool call, shell command, …).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    /// Task that raised the approval; may be a child of the routed task.
    pub task_id: String,
    pub description: String,
    pub command: Option<String>,
}

/// Result of answering an approval. Answering is idempotent: a second
/// response for the same id yields `Duplicate`, never a re-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Handled,
    Duplicate,
    NotFound,
    InProgress,
}

/// Snapshot of the engine's task queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatus {
    pub queued: u32,
    pub running: u32,
}

/// Operations the gateway invokes on the engine.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    async fn start_task(&self, task: TaskSpec) -> anyhow::Result<()>;

    /// Append a follow-up message to a non-terminal task.
    async fn send_message(&self, task_id: &str, text: &str) -> anyhow::Result<()>;

    async fn cancel_task(&self, task_id: &str) -> anyhow::Result<()>;

    async fn respond_to_approval(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> anyhow::Result<ApprovalOutcome>;

    async fn clear_stuck_tasks(&self) -> anyhow::Result<u32>;

    async fn queue_status(&self) -> anyhow::Result<QueueStatus>;
}

/// Events the engine emits, consumed by the gateway and dispatched to the
/// router.
#[derive(Debug, Clone)]
pub enum TaskEngineEvent {
    /// Partial or final assistant output for a task.
    AssistantMessage {
        task_id: String,
        text: String,
        streaming: bool,
    },
    TaskCompleted {
        task_id: String,
        summary: Option<String>,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: String,
    },
    /// A tool call inside a task failed; the task itself keeps running.
    ToolError {
        task_id: String,
        error: String,
    },
    ApprovalRequested {
        approval: ApprovalRequest,
    },
    FollowUpCompleted {
        task_id: String,
        text: Option<String>,
    },
    FollowUpFailed {
        task_id: String,
        error: String,
    },
}
