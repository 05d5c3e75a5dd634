//! Message routing: the orchestration core of the channel gateway.
//!
//! Runs the per-message pipeline (security → session → route), implements
//! the command grammar, tracks pending task responses, pending approvals and
//! inline-keyboard guards, coalesces streaming updates, and bridges task
//! engine events back to the correct chat.

pub mod approvals;
pub mod commands;
pub mod engine;
pub mod error;
pub mod pending;
pub mod router;
pub mod streaming;

pub use {
    engine::{
        ApprovalOutcome, ApprovalRequest, QueueStatus, TaskEngine, TaskEngineEvent, TaskSpec,
    },
    error::{Error, Result},
    pending::PendingTaskResponse,
    router::{MessageRouter, ProviderInfo, RouterConfig, SkillInfo},
};
