//! Approval delivery and responses.
//!
//! Approvals raised by child tasks surface in the chat of the nearest
//! ancestor task that still has a live route (or a persisted session),
//! found by a bounded walk over the `parent_task_id` edge. Responses are
//! idempotent: answering the same approval twice reports a duplicate
//! instead of re-executing side effects.

use std::time::Instant;

use tracing::{debug, info, warn};

use {
    courier_common::types::{CallbackQuery, IncomingMessage, InlineButton, InlineKeyboard, OutgoingMessage},
    courier_store::{channels::ChannelRecord, sessions::{SessionRecord, SessionState}},
};

use crate::{
    Result,
    engine::{ApprovalOutcome, ApprovalRequest},
    pending::{ApprovalClaim, GuardAction, GuardCheck, GuardTable, PendingApproval, short_id},
    router::MessageRouter,
};

/// Hard cap on the parent-chain walk; guarantees termination on malformed
/// (cyclic) task data.
const MAX_PARENT_HOPS: usize = 12;

/// Where an approval's owning chat was found.
struct ApprovalRoute {
    routed_task_id: String,
    channel_type: String,
    chat_id: String,
    session_id: String,
    requesting_user_id: Option<String>,
}

impl MessageRouter {
    // ── Outbound: deliver an approval prompt ────────────────────────────────

    /// Deliver an approval prompt to the chat owning the raising task (or
    /// its nearest routed ancestor).
    pub async fn send_approval_request(&self, approval: ApprovalRequest) -> Result<()> {
        let Some(route) = self.resolve_approval_route(&approval.task_id).await? else {
            warn!(
                approval = %approval.id,
                task = %approval.task_id,
                "no chat route found for approval; dropping"
            );
            return Ok(());
        };

        let is_group = match self.sessions.get(&route.session_id).await? {
            Some(session) => session
                .context
                .get("chat_is_group")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            None => false,
        };

        let pending = PendingApproval {
            approval: approval.clone(),
            routed_task_id: route.routed_task_id.clone(),
            session_id: route.session_id.clone(),
            chat_id: route.chat_id.clone(),
            channel_type: route.channel_type.clone(),
            requesting_user_id: route.requesting_user_id.clone(),
            is_group,
            expires_at: Instant::now() + self.config.approval_ttl,
        };
        self.approvals.insert(pending);
        self.sessions
            .set_state(&route.session_id, SessionState::WaitingApproval)
            .await?;

        // Best-effort expiry: if never answered, the entry is dropped after
        // the TTL. Lazy checks at claim time are the actual gate.
        {
            let router = self.clone();
            let approval_id = approval.id.clone();
            let ttl = self.config.approval_ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if router.approvals.expire(&approval_id) {
                    debug!(approval = %approval_id, "unanswered approval expired");
                }
            });
        }

        let others_pending = self
            .approvals
            .list_for_chat(&route.channel_type, &route.chat_id)
            .len()
            > 1;

        let mut text = format!("Approval required: {}", approval.description);
        if let Some(command) = &approval.command {
            text.push_str(&format!("\n`{command}`"));
        }

        let supports_keyboards = self
            .registry
            .get(&route.channel_type)
            .is_some_and(|a| a.supports_inline_keyboards());

        if supports_keyboards {
            if others_pending {
                text.push_str(&format!("\n[{}]", short_id(&approval.id)));
            }
            let keyboard = InlineKeyboard {
                rows: vec![vec![
                    InlineButton::new("Approve", format!("approve:{}", approval.id)),
                    InlineButton::new("Deny", format!("deny:{}", approval.id)),
                ]],
            };
            self.send_out(&route.channel_type, &OutgoingMessage {
                chat_id: route.chat_id.clone(),
                text,
                reply_to_message_id: None,
                keyboard: Some(keyboard),
            })
            .await;
        } else {
            let sid = short_id(&approval.id);
            text.push_str(&format!("\nReply /approve {sid} or /deny {sid}."));
            if others_pending {
                text.push_str("\nSeveral approvals are pending; include the id.");
            }
            self.send_text(&route.channel_type, &route.chat_id, &text).await;
        }

        info!(approval = %approval.id, task = %approval.task_id, chat = %route.chat_id, "approval prompt sent");
        Ok(())
    }

    /// Walk the parent chain until a task with a live route or a persisted
    /// session is found.
    async fn resolve_approval_route(&self, task_id: &str) -> Result<Option<ApprovalRoute>> {
        let mut current = task_id.to_string();
        for _ in 0..=MAX_PARENT_HOPS {
            if let Some(route) = self.routes.get(&current) {
                return Ok(Some(ApprovalRoute {
                    routed_task_id: current,
                    channel_type: route.channel_type,
                    chat_id: route.chat_id,
                    session_id: route.session_id,
                    requesting_user_id: route.requesting_user_id,
                }));
            }
            if let Some(session) = self.sessions.find_by_task(&current).await? {
                let Some(channel) = self.channels.get(&session.channel_id).await? else {
                    return Ok(None);
                };
                return Ok(Some(ApprovalRoute {
                    routed_task_id: current,
                    channel_type: channel.channel_type,
                    chat_id: session.chat_id.clone(),
                    session_id: session.id.clone(),
                    requesting_user_id: session.context_str("task_requester_id").map(Into::into),
                }));
            }
            let Some(task) = self.tasks.get(&current).await? else {
                return Ok(None);
            };
            let Some(parent) = task.parent_task_id else {
                return Ok(None);
            };
            current = parent;
        }
        warn!(task = %task_id, "approval routing exceeded parent-chain depth cap");
        Ok(None)
    }

    // ── Inbound: chat responses ─────────────────────────────────────────────

    /// Handle `/approve` / `/deny` from a chat. With several approvals
    /// pending the selector is mandatory and a disambiguation list is shown.
    pub(crate) async fn respond_from_chat(
        &self,
        channel: &ChannelRecord,
        session: &SessionRecord,
        message: &IncomingMessage,
        selector: Option<&str>,
        approved: bool,
    ) -> Result<()> {
        let pending = self
            .approvals
            .list_for_chat(&channel.channel_type, &message.chat_id);

        let target = match selector {
            None => match pending.as_slice() {
                [] => {
                    self.send_text(&channel.channel_type, &message.chat_id, "No pending approvals.")
                        .await;
                    return Ok(());
                },
                [only] => only.approval.id.clone(),
                _ => {
                    let lines = pending
                        .iter()
                        .enumerate()
                        .map(|(i, p)| {
                            format!("{}. [{}] {}", i + 1, p.short_id(), p.approval.description)
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(
                        &channel.channel_type,
                        &message.chat_id,
                        &format!(
                            "Several approvals are pending. Specify one:\n{lines}\nUse /approve <id> or /deny <id>."
                        ),
                    )
                    .await;
                    return Ok(());
                },
            },
            Some(selector) => {
                let found = pending
                    .iter()
                    .enumerate()
                    .find(|(i, p)| {
                        selector.parse::<usize>() == Ok(i + 1)
                            || p.approval.id.starts_with(selector)
                    })
                    .map(|(_, p)| p.approval.id.clone());
                match found {
                    Some(id) => id,
                    None if self.approvals.answered_recently(selector) => {
                        self.send_text(
                            &channel.channel_type,
                            &message.chat_id,
                            "That approval was already handled.",
                        )
                        .await;
                        return Ok(());
                    },
                    None => {
                        self.send_text(
                            &channel.channel_type,
                            &message.chat_id,
                            "No pending approval matches that id.",
                        )
                        .await;
                        return Ok(());
                    },
                }
            },
        };

        let reply = self
            .answer_approval(&target, &message.user_id, approved, Some(session))
            .await?;
        self.send_text(&channel.channel_type, &message.chat_id, &reply).await;
        Ok(())
    }

    /// Validate requester and claim + execute an approval response. Shared
    /// by chat commands and inline-button callbacks.
    async fn answer_approval(
        &self,
        approval_id: &str,
        responder_id: &str,
        approved: bool,
        _session: Option<&SessionRecord>,
    ) -> Result<String> {
        // Requester check happens before the claim so a refused response
        // leaves the approval pending for its owner.
        if let Some(pending) = self.approvals.get(approval_id)
            && pending.is_group
            && pending
                .requesting_user_id
                .as_deref()
                .is_some_and(|requester| requester != responder_id)
        {
            return Ok("Only the person who started this task can respond to its approvals.".into());
        }

        match self.approvals.claim(approval_id) {
            ApprovalClaim::Claimed(pending) => {
                match self.engine.respond_to_approval(approval_id, approved).await {
                    Ok(outcome) => {
                        if outcome == ApprovalOutcome::Handled {
                            self.sessions
                                .set_state(&pending.session_id, SessionState::Active)
                                .await?;
                        }
                        info!(approval = %approval_id, approved, ?outcome, "approval answered");
                        Ok(render_approval_outcome(outcome, approved))
                    },
                    Err(e) => {
                        warn!(approval = %approval_id, error = %e, "engine approval response failed");
                        // Put it back so a retry can still answer.
                        self.approvals.reinstate(*pending);
                        Ok("The task engine is unavailable right now, try again later.".into())
                    },
                }
            },
            ApprovalClaim::Duplicate => Ok("That approval was already handled.".into()),
            ApprovalClaim::NotFound => Ok("Unknown or expired approval.".into()),
        }
    }

    // ── Inline-keyboard callbacks ───────────────────────────────────────────

    /// Handle a button press: approval buttons and guarded selection menus.
    pub async fn handle_callback(&self, channel_type: &str, query: CallbackQuery) -> Result<()> {
        let Some((action, argument)) = query.data.split_once(':') else {
            self.answer_callback(channel_type, &query.callback_id, "Unsupported action")
                .await;
            return Ok(());
        };

        match action {
            "approve" | "deny" => {
                let reply = self
                    .answer_approval(argument, &query.user_id, action == "approve", None)
                    .await?;
                self.answer_callback(channel_type, &query.callback_id, &reply).await;
                self.send_text(channel_type, &query.chat_id, &reply).await;
                Ok(())
            },
            "workspace" | "provider" | "model" => {
                self.handle_guarded_callback(channel_type, &query, action, argument)
                    .await
            },
            _ => {
                self.answer_callback(channel_type, &query.callback_id, "Unsupported action")
                    .await;
                Ok(())
            },
        }
    }

    /// Validate the inline action guard for matching action, chat, requester
    /// and non-expiry before acknowledging; delete it once the action
    /// completes (one-shot).
    async fn handle_guarded_callback(
        &self,
        channel_type: &str,
        query: &CallbackQuery,
        action: &str,
        value: &str,
    ) -> Result<()> {
        let kind = match action {
            "workspace" => GuardAction::Workspace,
            "provider" => GuardAction::Provider,
            _ => GuardAction::Model,
        };
        let key = GuardTable::key(channel_type, &query.chat_id, &query.message_id);

        match self.guards.check(&key, kind, &query.user_id) {
            GuardCheck::WrongUser => {
                self.answer_callback(
                    channel_type,
                    &query.callback_id,
                    "Only the requester can use this menu.",
                )
                .await;
                return Ok(());
            },
            GuardCheck::Invalid => {
                // Stale keyboards (including any from before a restart)
                // cannot be replayed.
                self.answer_callback(channel_type, &query.callback_id, "This menu has expired.")
                    .await;
                return Ok(());
            },
            GuardCheck::Ok => {},
        }

        let Some(channel) = self.channels.get_by_type(channel_type).await? else {
            return Ok(());
        };
        let session = self
            .sessions
            .get_or_create(&channel.id, &query.chat_id, None)
            .await?;
        let reply = self.apply_selection(&channel, &session, kind, value).await?;

        self.guards.remove(&key);
        self.answer_callback(channel_type, &query.callback_id, &reply).await;
        self.send_text(channel_type, &query.chat_id, &reply).await;
        Ok(())
    }

    async fn answer_callback(&self, channel_type: &str, callback_id: &str, text: &str) {
        let Some(adapter) = self.registry.get(channel_type) else {
            return;
        };
        if let Err(e) = adapter.answer_callback(callback_id, Some(text)).await {
            debug!(channel = %channel_type, error = %e, "callback ack failed");
        }
    }
}

fn render_approval_outcome(outcome: ApprovalOutcome, approved: bool) -> String {
    match outcome {
        ApprovalOutcome::Handled => {
            if approved {
                "Approved. The task will continue.".into()
            } else {
                "Denied. The task was told no.".into()
            }
        },
        ApprovalOutcome::Duplicate => "That approval was already handled.".into(),
        ApprovalOutcome::NotFound => "Unknown or expired approval.".into(),
        ApprovalOutcome::InProgress => "That approval is already being processed.".into(),
    }
}
