//! In-memory routing state: pending task responses, pending approvals, and
//! inline-keyboard action guards.
//!
//! All three tables are caches over persisted rows (or short-lived UI
//! state); entries expire lazily: every read re-checks `expires_at` before
//! trusting an entry, so a missed cleanup can only leave a stale record
//! that the next validity check rejects.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::engine::ApprovalRequest;

// ── Pending task responses ──────────────────────────────────────────────────

/// Routing record linking a running task back to its originating chat.
#[derive(Debug, Clone)]
pub struct PendingTaskResponse {
    pub channel_type: String,
    pub chat_id: String,
    pub session_id: String,
    pub original_message_id: Option<String>,
    pub requesting_user_id: Option<String>,
    pub requesting_user_name: Option<String>,
    /// Last outbound message id for this task (draft-stream editing).
    pub last_channel_message_id: Option<String>,
}

/// Task id → pending response route.
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: Mutex<HashMap<String, PendingTaskResponse>>,
}

impl RouteTable {
    pub fn get(&self, task_id: &str) -> Option<PendingTaskResponse> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.get(task_id).cloned()
    }

    pub fn insert(&self, task_id: &str, route: PendingTaskResponse) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.insert(task_id.to_string(), route);
    }

    pub fn remove(&self, task_id: &str) -> Option<PendingTaskResponse> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.contains_key(task_id)
    }

    pub fn set_last_message(&self, task_id: &str, message_id: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(route) = routes.get_mut(task_id) {
            route.last_channel_message_id = Some(message_id.to_string());
        }
    }

    pub fn len(&self) -> usize {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.len()
    }

    pub fn clear(&self) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.clear();
    }
}

// ── Pending approvals ───────────────────────────────────────────────────────

/// An approval waiting for a chat response.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval: ApprovalRequest,
    /// Ancestor task that owns the chat route (not necessarily the raiser).
    pub routed_task_id: String,
    pub session_id: String,
    pub chat_id: String,
    pub channel_type: String,
    pub requesting_user_id: Option<String>,
    pub is_group: bool,
    pub expires_at: Instant,
}

impl PendingApproval {
    pub fn short_id(&self) -> &str {
        short_id(&self.approval.id)
    }
}

/// First eight characters of an approval id, used in textual selectors.
pub(crate) fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Result of claiming an approval for a response.
pub(crate) enum ApprovalClaim {
    /// The approval was pending; the caller owns side effects now.
    Claimed(Box<PendingApproval>),
    /// Already answered recently.
    Duplicate,
    /// Unknown or expired id.
    NotFound,
}

/// Approval id → pending approval, plus a short memory of answered ids so
/// duplicate responses can be distinguished from unknown ones.
pub(crate) struct ApprovalTable {
    pending: Mutex<HashMap<String, PendingApproval>>,
    answered: courier_common::sync::IdempotencyCache<bool>,
}

impl ApprovalTable {
    pub fn new(answered_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            answered: courier_common::sync::IdempotencyCache::new(answered_ttl),
        }
    }

    pub fn insert(&self, approval: PendingApproval) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(approval.approval.id.clone(), approval);
    }

    /// Non-expired approvals pending in one chat, oldest first.
    pub fn list_for_chat(&self, channel_type: &str, chat_id: &str) -> Vec<PendingApproval> {
        let now = Instant::now();
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = pending
            .values()
            .filter(|p| {
                p.channel_type == channel_type && p.chat_id == chat_id && now < p.expires_at
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        list
    }

    /// Non-expired approval by exact id, without claiming it.
    pub fn get(&self, approval_id: &str) -> Option<PendingApproval> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .get(approval_id)
            .filter(|p| Instant::now() < p.expires_at)
            .cloned()
    }

    /// Atomically claim an approval by exact id.
    pub fn claim(&self, approval_id: &str) -> ApprovalClaim {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.remove(approval_id) {
            Some(approval) if Instant::now() < approval.expires_at => {
                self.answered.insert(approval_id, true);
                self.answered.insert(short_id(approval_id), true);
                ApprovalClaim::Claimed(Box::new(approval))
            },
            Some(_) => ApprovalClaim::NotFound,
            None if self.answered.get(approval_id).is_some() => ApprovalClaim::Duplicate,
            None => ApprovalClaim::NotFound,
        }
    }

    /// True when `selector` (full or short id) was answered recently.
    pub fn answered_recently(&self, selector: &str) -> bool {
        self.answered.get(selector).is_some()
    }

    /// Reinstate an approval whose engine call failed, so a retry can
    /// still answer it.
    pub fn reinstate(&self, approval: PendingApproval) {
        self.answered.remove(&approval.approval.id);
        self.answered.remove(short_id(&approval.approval.id));
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(approval.approval.id.clone(), approval);
    }

    /// Drop an approval that was never answered (best-effort expiry timer).
    pub fn expire(&self, approval_id: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(approval_id) {
            Some(p) if Instant::now() >= p.expires_at => {
                pending.remove(approval_id);
                true
            },
            _ => false,
        }
    }
}

// ── Inline action guards ────────────────────────────────────────────────────

/// Action an inline keyboard is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Workspace,
    Provider,
    Model,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Provider => "provider",
            Self::Model => "model",
        }
    }
}

/// One-shot authorization token bound to a rendered keyboard message.
#[derive(Debug, Clone)]
pub struct InlineActionGuard {
    pub action: GuardAction,
    pub requesting_user_id: String,
    pub expires_at: Instant,
}

/// Outcome of validating a callback against its guard.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GuardCheck {
    Ok,
    WrongUser,
    /// Missing, expired, or registered for a different action; stale
    /// keyboards from before a restart land here.
    Invalid,
}

/// `channel_type:chat_id:message_id` → guard.
#[derive(Default)]
pub(crate) struct GuardTable {
    guards: Mutex<HashMap<String, InlineActionGuard>>,
}

impl GuardTable {
    pub fn key(channel_type: &str, chat_id: &str, message_id: &str) -> String {
        format!("{channel_type}:{chat_id}:{message_id}")
    }

    pub fn register(&self, key: String, guard: InlineActionGuard) {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        guards.retain(|_, g| now < g.expires_at);
        guards.insert(key, guard);
    }

    pub fn check(&self, key: &str, action: GuardAction, user_id: &str) -> GuardCheck {
        let guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        match guards.get(key) {
            Some(guard) if Instant::now() >= guard.expires_at => GuardCheck::Invalid,
            Some(guard) if guard.action != action => GuardCheck::Invalid,
            Some(guard) if guard.requesting_user_id != user_id => GuardCheck::WrongUser,
            Some(_) => GuardCheck::Ok,
            None => GuardCheck::Invalid,
        }
    }

    /// One-shot: delete after the guarded action completes.
    pub fn remove(&self, key: &str) {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        guards.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn approval(id: &str, chat_id: &str, ttl: Duration) -> PendingApproval {
        PendingApproval {
            approval: ApprovalRequest {
                id: id.into(),
                task_id: "t1".into(),
                description: "run a command".into(),
                command: Some("ls".into()),
            },
            routed_task_id: "t1".into(),
            session_id: "s1".into(),
            chat_id: chat_id.into(),
            channel_type: "telegram".into(),
            requesting_user_id: Some("u1".into()),
            is_group: false,
            expires_at: Instant::now() + ttl,
        }
    }

    #[test]
    fn claim_then_duplicate_then_not_found() {
        let table = ApprovalTable::new(Duration::from_secs(60));
        table.insert(approval("abcd1234-rest", "chat1", Duration::from_secs(60)));

        assert!(matches!(table.claim("abcd1234-rest"), ApprovalClaim::Claimed(_)));
        assert!(matches!(table.claim("abcd1234-rest"), ApprovalClaim::Duplicate));
        assert!(matches!(table.claim("unknown-id"), ApprovalClaim::NotFound));
    }

    #[test]
    fn expired_approval_is_not_claimable() {
        let table = ApprovalTable::new(Duration::from_secs(60));
        table.insert(approval("late", "chat1", Duration::from_secs(0)));
        assert!(matches!(table.claim("late"), ApprovalClaim::NotFound));
    }

    #[test]
    fn list_for_chat_filters_and_orders() {
        let table = ApprovalTable::new(Duration::from_secs(60));
        table.insert(approval("a1", "chat1", Duration::from_secs(10)));
        table.insert(approval("a2", "chat1", Duration::from_secs(20)));
        table.insert(approval("b1", "chat2", Duration::from_secs(10)));

        let list = table.list_for_chat("telegram", "chat1");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].approval.id, "a1");
    }

    #[test]
    fn guard_lifecycle() {
        let table = GuardTable::default();
        let key = GuardTable::key("telegram", "chat1", "42");
        table.register(key.clone(), InlineActionGuard {
            action: GuardAction::Workspace,
            requesting_user_id: "u1".into(),
            expires_at: Instant::now() + Duration::from_secs(600),
        });

        assert_eq!(table.check(&key, GuardAction::Workspace, "u1"), GuardCheck::Ok);
        assert_eq!(
            table.check(&key, GuardAction::Workspace, "u2"),
            GuardCheck::WrongUser
        );
        assert_eq!(
            table.check(&key, GuardAction::Model, "u1"),
            GuardCheck::Invalid
        );

        table.remove(&key);
        assert_eq!(
            table.check(&key, GuardAction::Workspace, "u1"),
            GuardCheck::Invalid
        );
    }

    #[test]
    fn expired_guard_is_invalid() {
        let table = GuardTable::default();
        let key = GuardTable::key("telegram", "chat1", "42");
        table.register(key.clone(), InlineActionGuard {
            action: GuardAction::Provider,
            requesting_user_id: "u1".into(),
            expires_at: Instant::now(),
        });
        assert_eq!(
            table.check(&key, GuardAction::Provider, "u1"),
            GuardCheck::Invalid
        );
    }

    #[test]
    fn route_table_roundtrip() {
        let table = RouteTable::default();
        table.insert("t1", PendingTaskResponse {
            channel_type: "telegram".into(),
            chat_id: "chat1".into(),
            session_id: "s1".into(),
            original_message_id: Some("m1".into()),
            requesting_user_id: Some("u1".into()),
            requesting_user_name: None,
            last_channel_message_id: None,
        });
        assert!(table.contains("t1"));
        table.set_last_message("t1", "m9");
        assert_eq!(
            table.get("t1").unwrap().last_channel_message_id.as_deref(),
            Some("m9")
        );
        assert_eq!(table.len(), 1);
        assert!(table.remove("t1").is_some());
        assert!(!table.contains("t1"));
    }

    #[test]
    fn short_id_is_prefix() {
        assert_eq!(short_id("abcdefgh-1234"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
