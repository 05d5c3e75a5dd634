//! The message router: inbound pipeline and outbound event bridge.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use {
    courier_channels::{AdapterRegistry, InboundEvent, adapter::AdapterStatus},
    courier_common::{
        time::now_ms,
        types::{AccessMode, IncomingMessage, InlineButton, InlineKeyboard, OutgoingMessage},
    },
    courier_security::{AccessDecision, SecurityManager, VerifyOutcome, looks_like_pairing_code},
    courier_sessions::SessionManager,
    courier_store::{
        channels::{ChannelRecord, ChannelRepo, ConnectionStatus},
        messages::{MessageLogRepo, NewMessageLogEntry},
        sessions::{SessionRecord, SessionState},
        tasks::{TaskRepo, TaskStatus},
        users::ChannelUserRepo,
        workspaces::WorkspaceRepo,
    },
};

use crate::{
    Result,
    commands::{Command, HELP_TEXT, looks_like_selection, resolve_selector},
    engine::{TaskEngine, TaskEngineEvent, TaskSpec},
    pending::{ApprovalTable, GuardAction, GuardTable, PendingTaskResponse, RouteTable},
    streaming::{Offer, StreamCoalescer},
};

/// Maximum characters of a task title derived from the first message.
const TITLE_MAX_CHARS: usize = 50;

/// A configured LLM provider and the models it serves.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub models: Vec<String>,
}

/// A skill announced through `/skills`.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
}

/// Router tuning knobs. Defaults match production behavior; tests shrink
/// the windows.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub providers: Vec<ProviderInfo>,
    pub skills: Vec<SkillInfo>,
    /// How long a pending-selection dialog stays answerable.
    pub selection_ttl: Duration,
    /// How long an inline keyboard stays pressable.
    pub guard_ttl: Duration,
    /// Best-effort local expiry for unanswered approvals.
    pub approval_ttl: Duration,
    /// Streaming-update debounce window.
    pub stream_debounce: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            skills: Vec::new(),
            selection_ttl: Duration::from_secs(120),
            guard_ttl: Duration::from_secs(600),
            approval_ttl: Duration::from_secs(360),
            stream_debounce: Duration::from_millis(1200),
        }
    }
}

/// The orchestration core: registers channel adapters, runs the per-message
/// pipeline (security → session → route), tracks pending task responses,
/// approvals and inline-keyboard guards, and bridges task-engine events back
/// to the correct chat.
///
/// All registries are plain fields with process-scoped lifetime; the router
/// is constructed once by the gateway and torn down via [`Self::shutdown`].
#[derive(Clone)]
pub struct MessageRouter {
    pub(crate) registry: Arc<AdapterRegistry>,
    pub(crate) security: Arc<SecurityManager>,
    pub(crate) sessions: SessionManager,
    pub(crate) engine: Arc<dyn TaskEngine>,
    pub(crate) channels: ChannelRepo,
    pub(crate) users: ChannelUserRepo,
    pub(crate) tasks: TaskRepo,
    pub(crate) workspaces: WorkspaceRepo,
    pub(crate) messages: MessageLogRepo,
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) approvals: Arc<ApprovalTable>,
    pub(crate) guards: Arc<GuardTable>,
    pub(crate) streams: Arc<StreamCoalescer>,
    pub(crate) config: Arc<RouterConfig>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AdapterRegistry>,
        security: Arc<SecurityManager>,
        sessions: SessionManager,
        engine: Arc<dyn TaskEngine>,
        channels: ChannelRepo,
        users: ChannelUserRepo,
        tasks: TaskRepo,
        workspaces: WorkspaceRepo,
        messages: MessageLogRepo,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            security,
            sessions,
            engine,
            channels,
            users,
            tasks,
            workspaces,
            messages,
            routes: Arc::new(RouteTable::default()),
            approvals: Arc::new(ApprovalTable::new(config.approval_ttl.max(Duration::from_secs(600)))),
            guards: Arc::new(GuardTable::default()),
            streams: Arc::new(StreamCoalescer::new(config.stream_debounce)),
            config: Arc::new(config),
        }
    }

    /// Drop all in-memory routing state. Persisted rows are untouched; a
    /// later [`Self::restore_pending_task_routes`] rebuilds the routes.
    pub fn shutdown(&self) {
        debug!("router shutdown: clearing in-memory routing state");
        self.routes.clear();
    }

    // ── Event entry point ───────────────────────────────────────────────────

    /// Handle one adapter event. Errors are isolated here: a failure in one
    /// chat's handling is logged and answered best-effort, and never aborts
    /// processing of other chats or adapters.
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message {
                channel_type,
                message,
            } => {
                let chat_id = message.chat_id.clone();
                if let Err(e) = self.handle_message(&channel_type, message).await {
                    warn!(channel = %channel_type, chat = %chat_id, error = %e, "message handling failed");
                    self.send_text(
                        &channel_type,
                        &chat_id,
                        "Something went wrong handling that message, please try again.",
                    )
                    .await;
                }
            },
            InboundEvent::Callback {
                channel_type,
                query,
            } => {
                if let Err(e) = self.handle_callback(&channel_type, query).await {
                    warn!(channel = %channel_type, error = %e, "callback handling failed");
                }
            },
            InboundEvent::StatusChange {
                channel_type,
                status,
            } => {
                if let Err(e) = self.record_status_change(&channel_type, &status).await {
                    warn!(channel = %channel_type, error = %e, "status update failed");
                }
            },
            InboundEvent::Error {
                channel_type,
                message,
            } => {
                warn!(channel = %channel_type, error = %message, "adapter error");
            },
        }
    }

    async fn record_status_change(
        &self,
        channel_type: &str,
        status: &AdapterStatus,
    ) -> Result<()> {
        let Some(channel) = self.channels.get_by_type(channel_type).await? else {
            return Ok(());
        };
        let mapped = match status {
            AdapterStatus::Disconnected => ConnectionStatus::Disconnected,
            AdapterStatus::Connecting => ConnectionStatus::Connecting,
            AdapterStatus::Connected => ConnectionStatus::Connected,
            AdapterStatus::Error { .. } => ConnectionStatus::Error,
        };
        self.channels.set_status(&channel.id, mapped).await?;
        info!(channel = %channel_type, status = ?status, "channel status changed");
        Ok(())
    }

    // ── Inbound pipeline ────────────────────────────────────────────────────

    /// The per-message pipeline: security check → message log → session →
    /// route.
    pub async fn handle_message(
        &self,
        channel_type: &str,
        message: IncomingMessage,
    ) -> Result<()> {
        let Some(channel) = self.channels.get_by_type(channel_type).await? else {
            warn!(channel = %channel_type, "message for unconfigured channel dropped");
            return Ok(());
        };

        let decision = self.security.check_access(&channel, &message).await?;

        // Every inbound message is logged, allowed or not.
        if let Err(e) = self
            .messages
            .log(NewMessageLogEntry {
                channel_id: channel.id.clone(),
                channel_type: channel.channel_type.clone(),
                user_id: message.user_id.clone(),
                user_name: message.user_name.clone(),
                chat_id: message.chat_id.clone(),
                chat_type: if message.is_group { "group" } else { "dm" }.into(),
                body: message.text.clone(),
                access_granted: decision.allowed,
            })
            .await
        {
            warn!(error = %e, "failed to log inbound message");
        }

        if !decision.allowed {
            return self.handle_denied(&channel, &message, decision).await;
        }

        if let Err(e) = self.users.touch_last_seen(&decision.user.id).await {
            warn!(error = %e, "failed to touch last_seen");
        }

        let session = self
            .sessions
            .get_or_create(&channel.id, &message.chat_id, None)
            .await?;
        let session = self
            .sessions
            .update_context(
                &session.id,
                serde_json::json!({
                    "last_user_id": message.user_id,
                    "last_user_name": message.user_name,
                    "last_message_id": message.message_id,
                    "chat_is_group": message.is_group,
                }),
            )
            .await?;

        self.route_message(&channel, session, &message).await
    }

    /// A denied sender still gets a chance to pair: a bare `/pair <code>`
    /// or code-shaped text is treated as a verification attempt before the
    /// unauthorized reply.
    async fn handle_denied(
        &self,
        channel: &ChannelRecord,
        message: &IncomingMessage,
        decision: AccessDecision,
    ) -> Result<()> {
        if decision.pairing_required {
            let text = message.text.trim();
            let candidate = match Command::parse(text) {
                Some(Command::Pair(code)) => code,
                Some(_) => None,
                None => looks_like_pairing_code(text).then(|| text.to_string()),
            };

            if let Some(code) = candidate {
                let outcome = self
                    .security
                    .verify_pairing_code(
                        channel,
                        &message.user_id,
                        message.user_name.as_deref(),
                        &code,
                    )
                    .await?;
                self.send_text(
                    &channel.channel_type,
                    &message.chat_id,
                    &render_verify_outcome(&outcome),
                )
                .await;
                return Ok(());
            }

            self.send_text(
                &channel.channel_type,
                &message.chat_id,
                "This channel requires pairing. Send your pairing code, or use /pair <code>.",
            )
            .await;
            return Ok(());
        }

        let reason = decision
            .reason
            .unwrap_or_else(|| "you are not authorized to use this channel".into());
        self.send_text(
            &channel.channel_type,
            &message.chat_id,
            &format!("Access denied: {reason}."),
        )
        .await;
        Ok(())
    }

    /// Dispatch an allowed message: command → pairing shape → pending
    /// selection → workspace resolution → task forwarding.
    async fn route_message(
        &self,
        channel: &ChannelRecord,
        session: SessionRecord,
        message: &IncomingMessage,
    ) -> Result<()> {
        let text = message.text.trim().to_string();
        if text.is_empty() && message.attachments.is_empty() {
            return Ok(());
        }

        if let Some(command) = Command::parse(&text) {
            return self.handle_command(channel, session, message, command).await;
        }

        // On pairing-mode channels, bare code-shaped text is a pairing
        // attempt; verification short-circuits for already-paired senders.
        if channel.security.mode == AccessMode::Pairing && looks_like_pairing_code(&text) {
            let outcome = self
                .security
                .verify_pairing_code(channel, &message.user_id, message.user_name.as_deref(), &text)
                .await?;
            self.send_text(
                &channel.channel_type,
                &message.chat_id,
                &render_verify_outcome(&outcome),
            )
            .await;
            return Ok(());
        }

        if self
            .try_resolve_pending_selection(channel, &session, &text)
            .await?
        {
            return Ok(());
        }

        let session = if session.workspace_id.is_none() {
            match self.assign_workspace(channel, session, &text).await? {
                Some(session) => session,
                // The message itself was a workspace selection.
                None => return Ok(()),
            }
        } else {
            session
        };

        self.forward_to_engine(channel, &session, message, &text, false)
            .await
    }

    // ── Selection dialogs ───────────────────────────────────────────────────

    /// Resolve an outstanding workspace/provider/model chooser, if one is
    /// young enough and the reply looks like a selection. Returns true when
    /// the message was consumed.
    async fn try_resolve_pending_selection(
        &self,
        channel: &ChannelRecord,
        session: &SessionRecord,
        text: &str,
    ) -> Result<bool> {
        let Some(pending) = session.context.get("pending_selection") else {
            return Ok(false);
        };
        let created_at = pending.get("created_at").and_then(|v| v.as_i64()).unwrap_or(0);
        if now_ms().saturating_sub(created_at) > self.config.selection_ttl.as_millis() as i64 {
            // Stale dialog: ignore it and route the message normally.
            return Ok(false);
        }
        if !looks_like_selection(text) {
            return Ok(false);
        }

        let options: Vec<String> = pending
            .get("options")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let names: Vec<&str> = options.iter().map(String::as_str).collect();
        let Some(idx) = resolve_selector(text, &names) else {
            return Ok(false);
        };

        let kind = match pending.get("kind").and_then(|v| v.as_str()) {
            Some("workspace") => GuardAction::Workspace,
            Some("provider") => GuardAction::Provider,
            Some("model") => GuardAction::Model,
            _ => return Ok(false),
        };

        let reply = self
            .apply_selection(channel, session, kind, &options[idx])
            .await?;
        self.sessions
            .update_context(&session.id, serde_json::json!({"pending_selection": null}))
            .await?;
        self.send_text(&channel.channel_type, &session.chat_id, &reply)
            .await;
        Ok(true)
    }

    /// Apply a workspace/provider/model choice to the session.
    pub(crate) async fn apply_selection(
        &self,
        _channel: &ChannelRecord,
        session: &SessionRecord,
        kind: GuardAction,
        value: &str,
    ) -> Result<String> {
        match kind {
            GuardAction::Workspace => {
                let Some(workspace) = self.workspaces.get_by_name(value).await? else {
                    return Ok(format!("Unknown workspace '{value}'."));
                };
                self.sessions
                    .set_workspace(&session.id, Some(&workspace.id))
                    .await?;
                Ok(format!("Workspace set to {}.", workspace.name))
            },
            GuardAction::Provider => {
                let Some(provider) = self
                    .config
                    .providers
                    .iter()
                    .find(|p| p.name.eq_ignore_ascii_case(value))
                else {
                    return Ok(format!("Unknown provider '{value}'."));
                };
                self.sessions
                    .update_context(
                        &session.id,
                        serde_json::json!({"provider": provider.name, "model": null}),
                    )
                    .await?;
                Ok(format!("Provider set to {}.", provider.name))
            },
            GuardAction::Model => {
                self.sessions
                    .update_context(&session.id, serde_json::json!({"model": value}))
                    .await?;
                Ok(format!("Model set to {value}."))
            },
        }
    }

    /// Offer a chooser: inline keyboard (guarded) when the adapter supports
    /// it, numbered text dialog (pending selection) otherwise.
    async fn open_selection(
        &self,
        channel: &ChannelRecord,
        session: &SessionRecord,
        message: &IncomingMessage,
        kind: GuardAction,
        title: &str,
        options: &[String],
    ) -> Result<()> {
        if options.is_empty() {
            self.send_text(
                &channel.channel_type,
                &session.chat_id,
                &format!("{title}: none configured."),
            )
            .await;
            return Ok(());
        }

        let supports_keyboards = self
            .registry
            .get(&channel.channel_type)
            .is_some_and(|a| a.supports_inline_keyboards());

        if supports_keyboards {
            let rows = options
                .iter()
                .map(|name| {
                    vec![InlineButton::new(
                        name.clone(),
                        format!("{}:{name}", kind.as_str()),
                    )]
                })
                .collect();
            let outgoing = OutgoingMessage {
                chat_id: session.chat_id.clone(),
                text: title.to_string(),
                reply_to_message_id: None,
                keyboard: Some(InlineKeyboard { rows }),
            };
            if let Some(message_id) = self.send_out(&channel.channel_type, &outgoing).await {
                self.guards.register(
                    GuardTable::key(&channel.channel_type, &session.chat_id, &message_id),
                    crate::pending::InlineActionGuard {
                        action: kind,
                        requesting_user_id: message.user_id.clone(),
                        expires_at: std::time::Instant::now() + self.config.guard_ttl,
                    },
                );
            }
            return Ok(());
        }

        let list = options
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{}. {name}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        self.send_text(
            &channel.channel_type,
            &session.chat_id,
            &format!("{title}\n{list}\nReply with a number or name."),
        )
        .await;
        self.sessions
            .update_context(
                &session.id,
                serde_json::json!({
                    "pending_selection": {
                        "kind": kind.as_str(),
                        "options": options,
                        "created_at": now_ms(),
                        "requester": message.user_id,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    // ── Workspace resolution ────────────────────────────────────────────────

    /// A session with no workspace gets one before its first task: the
    /// message may itself name a workspace; otherwise a single configured
    /// workspace is auto-selected, and the well-known temporary workspace is
    /// the fallback. Returns `None` when the message was consumed as a
    /// selection.
    async fn assign_workspace(
        &self,
        channel: &ChannelRecord,
        session: SessionRecord,
        text: &str,
    ) -> Result<Option<SessionRecord>> {
        let list = self.workspaces.list().await?;
        let names: Vec<&str> = list.iter().map(|w| w.name.as_str()).collect();

        if looks_like_selection(text)
            && let Some(idx) = resolve_selector(text, &names)
        {
            let workspace = &list[idx];
            self.sessions
                .set_workspace(&session.id, Some(&workspace.id))
                .await?;
            self.send_text(
                &channel.channel_type,
                &session.chat_id,
                &format!(
                    "Workspace set to {}. Send your task when ready.",
                    workspace.name
                ),
            )
            .await;
            return Ok(None);
        }

        let single = (list.len() == 1).then(|| list.into_iter().next()).flatten();
        let workspace = match single {
            Some(workspace) => workspace,
            None => self.workspaces.ensure_temp().await?,
        };
        debug!(session = %session.id, workspace = %workspace.name, "workspace auto-assigned");
        self.sessions
            .set_workspace(&session.id, Some(&workspace.id))
            .await?;
        let mut session = session;
        session.workspace_id = Some(workspace.id);
        Ok(Some(session))
    }

    // ── Task forwarding ─────────────────────────────────────────────────────

    /// Forward a message to the task engine: follow-up to the session's live
    /// task, or a fresh task with a registered response route.
    pub(crate) async fn forward_to_engine(
        &self,
        channel: &ChannelRecord,
        session: &SessionRecord,
        message: &IncomingMessage,
        prompt: &str,
        shell: bool,
    ) -> Result<()> {
        self.sessions
            .update_context(&session.id, serde_json::json!({"last_prompt": prompt}))
            .await?;

        if let Some(task_id) = session.task_id.as_deref()
            && let Some(task) = self.tasks.get(task_id).await?
            && !task.status.is_terminal()
        {
            if !self.routes.contains(task_id) {
                self.routes.insert(task_id, self.route_for(channel, session, message));
            }
            if let Err(e) = self.engine.send_message(task_id, prompt).await {
                warn!(task = %task_id, error = %e, "engine rejected follow-up");
                self.send_text(
                    &channel.channel_type,
                    &session.chat_id,
                    "The task engine is unavailable right now, try again later.",
                )
                .await;
            }
            return Ok(());
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let title = truncate_title(prompt);
        self.tasks
            .insert(&task_id, None, session.workspace_id.as_deref(), &title)
            .await?;
        self.routes.insert(&task_id, self.route_for(channel, session, message));
        self.sessions.link_task(&session.id, &task_id).await?;
        self.sessions
            .update_context(
                &session.id,
                serde_json::json!({
                    "task_requester_id": message.user_id,
                    "task_requester_name": message.user_name,
                }),
            )
            .await?;

        let spec = TaskSpec {
            id: task_id.clone(),
            workspace_id: session.workspace_id.clone(),
            title: title.clone(),
            prompt: prompt.to_string(),
            provider: session.context_str("provider").map(Into::into),
            model: session.context_str("model").map(Into::into),
            shell,
        };
        if let Err(e) = self.engine.start_task(spec).await {
            warn!(task = %task_id, error = %e, "engine rejected task");
            self.routes.remove(&task_id);
            self.sessions.unlink_task(&session.id).await?;
            self.tasks.set_status(&task_id, TaskStatus::Failed).await?;
            self.send_text(
                &channel.channel_type,
                &session.chat_id,
                "The task engine is unavailable right now, try again later.",
            )
            .await;
            return Ok(());
        }

        info!(task = %task_id, title = %title, "task started");
        self.send_text(
            &channel.channel_type,
            &session.chat_id,
            &format!("Working on it: {title}"),
        )
        .await;
        Ok(())
    }

    fn route_for(
        &self,
        channel: &ChannelRecord,
        session: &SessionRecord,
        message: &IncomingMessage,
    ) -> PendingTaskResponse {
        PendingTaskResponse {
            channel_type: channel.channel_type.clone(),
            chat_id: session.chat_id.clone(),
            session_id: session.id.clone(),
            original_message_id: Some(message.message_id.clone()),
            requesting_user_id: Some(message.user_id.clone()),
            requesting_user_name: message.user_name.clone(),
            last_channel_message_id: None,
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    async fn handle_command(
        &self,
        channel: &ChannelRecord,
        session: SessionRecord,
        message: &IncomingMessage,
        command: Command,
    ) -> Result<()> {
        let chat = session.chat_id.clone();
        let ct = channel.channel_type.clone();
        match command {
            Command::Start | Command::Help => {
                self.send_text(&ct, &chat, HELP_TEXT).await;
            },
            Command::Status => {
                let reply = self.render_status(&session).await?;
                self.send_text(&ct, &chat, &reply).await;
            },
            Command::Workspaces => {
                let list = self.workspaces.list().await?;
                if list.is_empty() {
                    self.send_text(&ct, &chat, "No workspaces configured. Use /addworkspace <name> [path].")
                        .await;
                } else {
                    let lines = list
                        .iter()
                        .enumerate()
                        .map(|(i, w)| {
                            let marker = if session.workspace_id.as_deref() == Some(w.id.as_str()) {
                                " *"
                            } else {
                                ""
                            };
                            format!("{}. {}{marker}", i + 1, w.name)
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(&ct, &chat, &format!("Workspaces:\n{lines}")).await;
                }
            },
            Command::Workspace(None) => {
                let names: Vec<String> = self
                    .workspaces
                    .list()
                    .await?
                    .into_iter()
                    .map(|w| w.name)
                    .collect();
                self.open_selection(
                    channel,
                    &session,
                    message,
                    GuardAction::Workspace,
                    "Select a workspace:",
                    &names,
                )
                .await?;
            },
            Command::Workspace(Some(selector)) => {
                let list = self.workspaces.list().await?;
                let names: Vec<&str> = list.iter().map(|w| w.name.as_str()).collect();
                match resolve_selector(&selector, &names) {
                    Some(idx) => {
                        let reply = self
                            .apply_selection(channel, &session, GuardAction::Workspace, &list[idx].name)
                            .await?;
                        self.send_text(&ct, &chat, &reply).await;
                    },
                    None => {
                        self.send_text(
                            &ct,
                            &chat,
                            &format!("No workspace matches '{selector}'. See /workspaces."),
                        )
                        .await;
                    },
                }
            },
            Command::AddWorkspace { name, path } => {
                if self.workspaces.get_by_name(&name).await?.is_some() {
                    self.send_text(&ct, &chat, &format!("Workspace '{name}' already exists."))
                        .await;
                } else {
                    let workspace = self.workspaces.insert(&name, path.as_deref()).await?;
                    self.send_text(&ct, &chat, &format!("Workspace '{}' added.", workspace.name))
                        .await;
                }
            },
            Command::RemoveWorkspace(selector) => {
                let list = self.workspaces.list().await?;
                let names: Vec<&str> = list.iter().map(|w| w.name.as_str()).collect();
                match resolve_selector(&selector, &names) {
                    Some(idx) => {
                        let workspace = &list[idx];
                        self.workspaces.remove(&workspace.id).await?;
                        if session.workspace_id.as_deref() == Some(workspace.id.as_str()) {
                            self.sessions.set_workspace(&session.id, None).await?;
                        }
                        self.send_text(&ct, &chat, &format!("Workspace '{}' removed.", workspace.name))
                            .await;
                    },
                    None => {
                        self.send_text(&ct, &chat, &format!("No workspace matches '{selector}'."))
                            .await;
                    },
                }
            },
            Command::Providers => {
                if self.config.providers.is_empty() {
                    self.send_text(&ct, &chat, "No providers configured.").await;
                } else {
                    let current = session.context_str("provider").unwrap_or("default");
                    let lines = self
                        .config
                        .providers
                        .iter()
                        .enumerate()
                        .map(|(i, p)| {
                            let marker = if p.name == current { " *" } else { "" };
                            format!("{}. {}{marker}", i + 1, p.name)
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(&ct, &chat, &format!("Providers:\n{lines}")).await;
                }
            },
            Command::Provider(None) => {
                let names: Vec<String> =
                    self.config.providers.iter().map(|p| p.name.clone()).collect();
                self.open_selection(
                    channel,
                    &session,
                    message,
                    GuardAction::Provider,
                    "Select a provider:",
                    &names,
                )
                .await?;
            },
            Command::Provider(Some(selector)) => {
                let names: Vec<&str> =
                    self.config.providers.iter().map(|p| p.name.as_str()).collect();
                match resolve_selector(&selector, &names) {
                    Some(idx) => {
                        let name = self.config.providers[idx].name.clone();
                        let reply = self
                            .apply_selection(channel, &session, GuardAction::Provider, &name)
                            .await?;
                        self.send_text(&ct, &chat, &reply).await;
                    },
                    None => {
                        self.send_text(&ct, &chat, &format!("No provider matches '{selector}'."))
                            .await;
                    },
                }
            },
            Command::Models => {
                let models = self.models_for(&session);
                if models.is_empty() {
                    self.send_text(&ct, &chat, "No models available for the current provider.")
                        .await;
                } else {
                    let current = session.context_str("model").unwrap_or("default");
                    let lines = models
                        .iter()
                        .enumerate()
                        .map(|(i, m)| {
                            let marker = if m == current { " *" } else { "" };
                            format!("{}. {m}{marker}", i + 1)
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(&ct, &chat, &format!("Models:\n{lines}")).await;
                }
            },
            Command::Model(None) => {
                let models = self.models_for(&session);
                self.open_selection(
                    channel,
                    &session,
                    message,
                    GuardAction::Model,
                    "Select a model:",
                    &models,
                )
                .await?;
            },
            Command::Model(Some(selector)) => {
                let models = self.models_for(&session);
                let names: Vec<&str> = models.iter().map(String::as_str).collect();
                match resolve_selector(&selector, &names) {
                    Some(idx) => {
                        let model = models[idx].clone();
                        let reply = self
                            .apply_selection(channel, &session, GuardAction::Model, &model)
                            .await?;
                        self.send_text(&ct, &chat, &reply).await;
                    },
                    None => {
                        self.send_text(&ct, &chat, &format!("No model matches '{selector}'."))
                            .await;
                    },
                }
            },
            Command::Cancel => {
                match session.task_id.as_deref() {
                    Some(task_id) => {
                        let task_id = task_id.to_string();
                        if let Err(e) = self.engine.cancel_task(&task_id).await {
                            debug!(task = %task_id, error = %e, "engine cancel failed (continuing local cleanup)");
                        }
                        // Same cleanup whether cancellation arrives via this
                        // call or a later task_cancelled event.
                        self.finish_task_cancelled(&task_id).await?;
                    },
                    None => {
                        self.send_text(&ct, &chat, "No active task to cancel.").await;
                    },
                }
            },
            Command::NewTask => {
                self.sessions.unlink_task(&session.id).await?;
                self.sessions
                    .update_context(
                        &session.id,
                        serde_json::json!({
                            "pending_selection": null,
                            "task_requester_id": null,
                            "task_requester_name": null,
                        }),
                    )
                    .await?;
                self.send_text(&ct, &chat, "Started fresh. Send your next task.").await;
            },
            Command::Pair(Some(code)) => {
                let outcome = self
                    .security
                    .verify_pairing_code(channel, &message.user_id, message.user_name.as_deref(), &code)
                    .await?;
                self.send_text(&ct, &chat, &render_verify_outcome(&outcome)).await;
            },
            Command::Pair(None) => {
                self.send_text(&ct, &chat, "Usage: /pair <code>").await;
            },
            Command::Shell(cmd) => {
                if cmd.trim().is_empty() {
                    self.send_text(&ct, &chat, "Usage: /shell <command>").await;
                } else {
                    let session = self.ensure_workspace(channel, session).await?;
                    self.forward_to_engine(channel, &session, message, cmd.trim(), true)
                        .await?;
                }
            },
            Command::Approve(selector) => {
                self.respond_from_chat(channel, &session, message, selector.as_deref(), true)
                    .await?;
            },
            Command::Deny(selector) => {
                self.respond_from_chat(channel, &session, message, selector.as_deref(), false)
                    .await?;
            },
            Command::Queue { clear } => {
                if clear {
                    match self.engine.clear_stuck_tasks().await {
                        Ok(n) => {
                            self.send_text(&ct, &chat, &format!("Cleared {n} stuck task(s)."))
                                .await;
                        },
                        Err(e) => {
                            warn!(error = %e, "clear_stuck_tasks failed");
                            self.send_text(&ct, &chat, "Could not clear the queue, try again later.")
                                .await;
                        },
                    }
                } else {
                    match self.engine.queue_status().await {
                        Ok(status) => {
                            self.send_text(
                                &ct,
                                &chat,
                                &format!(
                                    "Queue: {} queued, {} running.",
                                    status.queued, status.running
                                ),
                            )
                            .await;
                        },
                        Err(e) => {
                            warn!(error = %e, "queue_status failed");
                            self.send_text(&ct, &chat, "Queue status unavailable, try again later.")
                                .await;
                        },
                    }
                }
            },
            Command::Retry => {
                match session.context_str("last_prompt").map(String::from) {
                    Some(prompt) => {
                        let session = self.ensure_workspace(channel, session).await?;
                        self.forward_to_engine(channel, &session, message, &prompt, false)
                            .await?;
                    },
                    None => {
                        self.send_text(&ct, &chat, "Nothing to retry yet.").await;
                    },
                }
            },
            Command::History => {
                let entries = self.messages.list_by_chat(&channel.id, &chat, 10).await?;
                if entries.is_empty() {
                    self.send_text(&ct, &chat, "No messages logged for this chat yet.").await;
                } else {
                    let lines = entries
                        .iter()
                        .rev()
                        .map(|e| {
                            let who = e.user_name.as_deref().unwrap_or(&e.user_id);
                            let body: String = e.body.chars().take(80).collect();
                            format!("• {who}: {body}")
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(&ct, &chat, &format!("Recent messages:\n{lines}")).await;
                }
            },
            Command::Skills => {
                if self.config.skills.is_empty() {
                    self.send_text(&ct, &chat, "No skills configured.").await;
                } else {
                    let lines = self
                        .config
                        .skills
                        .iter()
                        .map(|s| format!("• {}: {}", s.name, s.description))
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.send_text(&ct, &chat, &format!("Skills:\n{lines}")).await;
                }
            },
            Command::Skill(Some(name)) => {
                match self
                    .config
                    .skills
                    .iter()
                    .find(|s| s.name.eq_ignore_ascii_case(&name))
                {
                    Some(skill) => {
                        self.send_text(&ct, &chat, &format!("{}: {}", skill.name, skill.description))
                            .await;
                    },
                    None => {
                        self.send_text(&ct, &chat, &format!("No skill named '{name}'. See /skills."))
                            .await;
                    },
                }
            },
            Command::Skill(None) => {
                self.send_text(&ct, &chat, "Usage: /skill <name>").await;
            },
            Command::Settings => {
                let workspace = match session.workspace_id.as_deref() {
                    Some(id) => self
                        .workspaces
                        .get(id)
                        .await?
                        .map(|w| w.name)
                        .unwrap_or_else(|| "(missing)".into()),
                    None => "(none)".into(),
                };
                let reply = format!(
                    "Channel: {} ({:?} mode)\nWorkspace: {workspace}\nProvider: {}\nModel: {}",
                    channel.name,
                    channel.security.mode,
                    session.context_str("provider").unwrap_or("default"),
                    session.context_str("model").unwrap_or("default"),
                );
                self.send_text(&ct, &chat, &reply).await;
            },
            Command::Debug => {
                let dump = serde_json::json!({
                    "session_id": session.id,
                    "state": session.state,
                    "task_id": session.task_id,
                    "workspace_id": session.workspace_id,
                    "context": session.context,
                    "pending_routes": self.routes.len(),
                });
                let reply = serde_json::to_string_pretty(&dump)
                    .unwrap_or_else(|_| "debug dump failed".into());
                self.send_text(&ct, &chat, &reply).await;
            },
            Command::Version => {
                self.send_text(&ct, &chat, concat!("courier ", env!("CARGO_PKG_VERSION")))
                    .await;
            },
            Command::Unknown(name) => {
                let reply = if name.is_empty() {
                    "Unknown command. Try /help.".to_string()
                } else {
                    format!("Unknown command /{name}. Try /help.")
                };
                self.send_text(&ct, &chat, &reply).await;
            },
        }
        Ok(())
    }

    fn models_for(&self, session: &SessionRecord) -> Vec<String> {
        let current = session.context_str("provider");
        let provider = match current {
            Some(name) => self
                .config
                .providers
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name)),
            None => self.config.providers.first(),
        };
        provider.map(|p| p.models.clone()).unwrap_or_default()
    }

    async fn render_status(&self, session: &SessionRecord) -> Result<String> {
        let mut lines = vec![format!("Session: {}", session.state.as_str())];
        if let Some(task_id) = session.task_id.as_deref() {
            match self.tasks.get(task_id).await? {
                Some(task) => lines.push(format!("Task: {} ({})", task.title, task.status.as_str())),
                None => lines.push(format!("Task: {task_id} (unknown)")),
            }
        } else {
            lines.push("Task: none".into());
        }
        match self.engine.queue_status().await {
            Ok(status) => lines.push(format!(
                "Queue: {} queued, {} running",
                status.queued, status.running
            )),
            Err(_) => lines.push("Queue: unavailable".into()),
        }
        Ok(lines.join("\n"))
    }

    /// Give a session a workspace before command-driven task starts
    /// (`/shell`, `/retry`) that skip the normal resolution step.
    async fn ensure_workspace(
        &self,
        channel: &ChannelRecord,
        session: SessionRecord,
    ) -> Result<SessionRecord> {
        if session.workspace_id.is_some() {
            return Ok(session);
        }
        match self.assign_workspace(channel, session.clone(), "").await? {
            Some(session) => Ok(session),
            None => Ok(session),
        }
    }

    // ── Task engine events ──────────────────────────────────────────────────

    /// Dispatch one engine event. Per-event errors are logged, never
    /// propagated.
    pub async fn handle_engine_event(&self, event: TaskEngineEvent) {
        let result = match event {
            TaskEngineEvent::AssistantMessage {
                task_id,
                text,
                streaming,
            } => {
                self.send_task_update(&task_id, &text, streaming).await;
                Ok(())
            },
            TaskEngineEvent::TaskCompleted { task_id, summary } => {
                self.finish_task_completed(&task_id, summary.as_deref()).await
            },
            TaskEngineEvent::TaskFailed { task_id, error } => {
                self.finish_task_failed(&task_id, &error).await
            },
            TaskEngineEvent::TaskCancelled { task_id } => {
                self.finish_task_cancelled(&task_id).await
            },
            TaskEngineEvent::ToolError { task_id, error } => {
                // Informational: the task keeps running.
                if let Some(route) = self.routes.get(&task_id) {
                    self.deliver(&route, &format!("A tool hit an error: {error}")).await;
                }
                Ok(())
            },
            TaskEngineEvent::ApprovalRequested { approval } => {
                self.send_approval_request(approval).await
            },
            TaskEngineEvent::FollowUpCompleted { task_id, text } => {
                if let Some(text) = text {
                    self.send_task_update(&task_id, &text, false).await;
                }
                Ok(())
            },
            TaskEngineEvent::FollowUpFailed { task_id, error } => {
                if let Some(route) = self.routes.get(&task_id) {
                    self.deliver(&route, &format!("Follow-up failed: {error}")).await;
                }
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!(error = %e, "engine event handling failed");
        }
    }

    /// Push a task update to its chat: draft-stream edit when the adapter
    /// supports it, debounced buffering otherwise. Final updates flush
    /// immediately and disarm any pending buffered flush.
    pub async fn send_task_update(&self, task_id: &str, text: &str, streaming: bool) {
        let Some(route) = self.routes.get(task_id) else {
            debug!(task = %task_id, "task update without a route dropped");
            return;
        };
        let Some(adapter) = self.registry.get(&route.channel_type) else {
            warn!(channel = %route.channel_type, "task update for unregistered adapter");
            return;
        };

        if adapter.supports_draft_stream() {
            if let Some(message_id) = route.last_channel_message_id.as_deref()
                && adapter
                    .edit_message(&route.chat_id, message_id, text)
                    .await
                    .is_ok()
            {
                return;
            }
            match adapter
                .send_message(&OutgoingMessage::text(&route.chat_id, text))
                .await
            {
                Ok(message_id) => self.routes.set_last_message(task_id, &message_id),
                Err(e) => warn!(task = %task_id, error = %e, "draft send failed"),
            }
            return;
        }

        if !streaming {
            // Final text wins: disarm any buffered streaming flush first.
            self.streams.cancel(task_id);
            self.deliver(&route, text).await;
            return;
        }

        match self.streams.offer(task_id, text) {
            Offer::SendNow => self.deliver(&route, text).await,
            Offer::Arm { delay, generation } => {
                let router = self.clone();
                let task_id = task_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(buffered) = router.streams.fire(&task_id, generation)
                        && let Some(route) = router.routes.get(&task_id)
                    {
                        router.deliver(&route, &buffered).await;
                    }
                });
            },
            Offer::Buffered => {},
        }
    }

    pub(crate) async fn deliver(&self, route: &PendingTaskResponse, text: &str) {
        let Some(adapter) = self.registry.get(&route.channel_type) else {
            return;
        };
        if let Err(e) = adapter
            .send_message(&OutgoingMessage::text(&route.chat_id, text))
            .await
        {
            // A failed outbound send never aborts the pipeline.
            warn!(channel = %route.channel_type, chat = %route.chat_id, error = %e, "delivery failed");
        }
    }

    async fn finish_task_completed(&self, task_id: &str, summary: Option<&str>) -> Result<()> {
        self.tasks.set_status(task_id, TaskStatus::Completed).await?;
        self.streams.cancel(task_id);
        if let Some(route) = self.routes.remove(task_id) {
            self.deliver(&route, summary.unwrap_or("Task completed.")).await;
            // Completed sessions stay linked for follow-ups, back at idle.
            self.sessions
                .set_state(&route.session_id, SessionState::Idle)
                .await?;
        } else if let Some(session) = self.sessions.find_by_task(task_id).await? {
            self.sessions.set_state(&session.id, SessionState::Idle).await?;
        }
        info!(task = %task_id, "task completed");
        Ok(())
    }

    async fn finish_task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        self.tasks.set_status(task_id, TaskStatus::Failed).await?;
        self.streams.cancel(task_id);
        if let Some(route) = self.routes.remove(task_id) {
            self.deliver(&route, &format!("Task failed: {error}")).await;
            // Abnormal termination detaches the session.
            self.sessions.unlink_task(&route.session_id).await?;
        } else if let Some(session) = self.sessions.find_by_task(task_id).await? {
            self.sessions.unlink_task(&session.id).await?;
        }
        warn!(task = %task_id, error, "task failed");
        Ok(())
    }

    /// Cancellation cleanup, identical whether triggered by `/cancel` or by
    /// a `task_cancelled` engine event, and idempotent across both.
    pub(crate) async fn finish_task_cancelled(&self, task_id: &str) -> Result<()> {
        self.tasks.set_status(task_id, TaskStatus::Cancelled).await?;
        self.streams.cancel(task_id);
        if let Some(route) = self.routes.remove(task_id) {
            if let Some(session) = self.sessions.get(&route.session_id).await?
                && session.task_id.as_deref() == Some(task_id)
            {
                self.sessions.unlink_task(&session.id).await?;
            }
            self.deliver(&route, "Task cancelled.").await;
        } else if let Some(session) = self.sessions.find_by_task(task_id).await? {
            self.sessions.unlink_task(&session.id).await?;
            if let Some(channel) = self.channels.get(&session.channel_id).await? {
                self.send_text(&channel.channel_type, &session.chat_id, "Task cancelled.")
                    .await;
            }
        }
        Ok(())
    }

    // ── Restart recovery ────────────────────────────────────────────────────

    /// Re-derive pending task routes from persisted sessions whose task is
    /// still non-terminal. Invoked on adapter connect; requester identity is
    /// restored from session context.
    pub async fn restore_pending_task_routes(&self, channel_type: &str) -> Result<u32> {
        let Some(channel) = self.channels.get_by_type(channel_type).await? else {
            return Ok(0);
        };
        let mut restored = 0;
        for session in self.sessions.list_linked(&channel.id).await? {
            let Some(task_id) = session.task_id.clone() else {
                continue;
            };
            let Some(task) = self.tasks.get(&task_id).await? else {
                continue;
            };
            if task.status.is_terminal() {
                // Stale link from an unclean shutdown.
                self.sessions.unlink_task(&session.id).await?;
                continue;
            }
            if self.routes.contains(&task_id) {
                continue;
            }
            self.routes.insert(&task_id, PendingTaskResponse {
                channel_type: channel.channel_type.clone(),
                chat_id: session.chat_id.clone(),
                session_id: session.id.clone(),
                original_message_id: session.context_str("last_message_id").map(Into::into),
                requesting_user_id: session.context_str("task_requester_id").map(Into::into),
                requesting_user_name: session.context_str("task_requester_name").map(Into::into),
                last_channel_message_id: None,
            });
            restored += 1;
        }
        info!(channel = %channel_type, restored, "pending task routes restored");
        Ok(restored)
    }

    // ── Outbound helpers ────────────────────────────────────────────────────

    /// Best-effort text send; returns the message id when delivered.
    pub(crate) async fn send_text(
        &self,
        channel_type: &str,
        chat_id: &str,
        text: &str,
    ) -> Option<String> {
        self.send_out(channel_type, &OutgoingMessage::text(chat_id, text))
            .await
    }

    pub(crate) async fn send_out(
        &self,
        channel_type: &str,
        message: &OutgoingMessage,
    ) -> Option<String> {
        let Some(adapter) = self.registry.get(channel_type) else {
            warn!(channel = %channel_type, "send to unregistered adapter dropped");
            return None;
        };
        match adapter.send_message(message).await {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                warn!(channel = %channel_type, chat = %message.chat_id, error = %e, "outbound send failed");
                None
            },
        }
    }
}

pub(crate) fn render_verify_outcome(outcome: &VerifyOutcome) -> String {
    match outcome {
        VerifyOutcome::Success => "Pairing successful. You can talk to me here now.".into(),
        VerifyOutcome::AlreadyPaired => "You are already paired on this channel.".into(),
        VerifyOutcome::Invalid { attempts_remaining } => format!(
            "Invalid pairing code. {attempts_remaining} attempt(s) remaining."
        ),
        VerifyOutcome::Expired => "That pairing code has expired. Ask for a new one.".into(),
        VerifyOutcome::LockedOut { remaining_secs } => {
            let minutes = (remaining_secs + 59) / 60;
            format!("Too many attempts. Try again in {minutes} minute(s).")
        },
    }
}

pub(crate) fn truncate_title(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        line.chars().take(TITLE_MAX_CHARS).collect()
    }
}
