use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use {
    courier_channels::{AdapterRegistry, ChannelAdapter, InboundEvent},
    courier_router::{MessageRouter, TaskEngine, TaskEngineEvent},
    courier_security::{SecurityManager, VerifyOutcome},
    courier_sessions::SessionManager,
    courier_store::{
        channels::{ChannelRecord, ChannelRepo, ConnectionStatus},
        messages::MessageLogRepo,
        schema,
        sessions::SessionRepo,
        tasks::TaskRepo,
        users::{ChannelUserRecord, ChannelUserRepo},
        workspaces::WorkspaceRepo,
    },
    courier_tunnel::TunnelManager,
};

use crate::config::GatewayConfig;

/// Gateway-level result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway-level errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown channel: {channel_type}")]
    UnknownChannel { channel_type: String },

    #[error("no adapter registered for channel: {channel_type}")]
    NoAdapter { channel_type: String },

    #[error(transparent)]
    Store(#[from] courier_store::Error),

    #[error(transparent)]
    Security(#[from] courier_security::Error),

    #[error(transparent)]
    Channel(#[from] courier_channels::Error),

    #[error(transparent)]
    Router(#[from] courier_router::Error),
}

/// Size of the inbound adapter event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Composition root: owns the database pool, constructs the managers and
/// the router, and runs the event loops that connect adapters and the task
/// engine to the router.
pub struct ChannelGateway {
    channels: ChannelRepo,
    users: ChannelUserRepo,
    security: Arc<SecurityManager>,
    registry: Arc<AdapterRegistry>,
    router: MessageRouter,
    tunnel: Option<TunnelManager>,
    events_tx: mpsc::Sender<InboundEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl ChannelGateway {
    /// Build the gateway: initialize the schema, sync configured channels
    /// into the store, and construct the router.
    pub async fn new(
        pool: sqlx::SqlitePool,
        engine: Arc<dyn TaskEngine>,
        config: GatewayConfig,
    ) -> Result<Self> {
        schema::init(&pool).await?;

        let channels = ChannelRepo::new(pool.clone());
        let users = ChannelUserRepo::new(pool.clone());
        for channel in &config.channels {
            channels
                .upsert(
                    &channel.channel_type,
                    &channel.name,
                    &channel.config,
                    &channel.security,
                )
                .await?;
        }

        let security = Arc::new(SecurityManager::new(users.clone()));
        let registry = Arc::new(AdapterRegistry::new());
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&security),
            SessionManager::new(SessionRepo::new(pool.clone())),
            engine,
            channels.clone(),
            users.clone(),
            TaskRepo::new(pool.clone()),
            WorkspaceRepo::new(pool.clone()),
            MessageLogRepo::new(pool.clone()),
            config.router_config(),
        );

        let tunnel = config.tunnel_config().map(TunnelManager::new);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        Ok(Self {
            channels,
            users,
            security,
            registry,
            router,
            tunnel,
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
        })
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn tunnel(&self) -> Option<&TunnelManager> {
        self.tunnel.as_ref()
    }

    /// Register a concrete adapter implementation for its channel type.
    pub fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        info!(channel = %adapter.channel_type(), "adapter registered");
        self.registry.register(adapter);
    }

    /// Consume adapter and engine events until both streams close. Each
    /// event is handled to completion before the next; errors are isolated
    /// per event inside the router.
    pub async fn run(&self, mut engine_events: mpsc::Receiver<TaskEngineEvent>) {
        let Some(mut inbound) = self.events_rx.lock().await.take() else {
            warn!("gateway event loop already running");
            return;
        };
        info!("gateway event loop started");
        loop {
            tokio::select! {
                // Adapter events first, so queued messages drain before a
                // closing engine stream ends the loop.
                biased;
                event = inbound.recv() => match event {
                    Some(event) => self.router.handle_event(event).await,
                    None => break,
                },
                event = engine_events.recv() => match event {
                    Some(event) => self.router.handle_engine_event(event).await,
                    None => break,
                },
            }
        }
        info!("gateway event loop stopped");
    }

    // ── Channel control ─────────────────────────────────────────────────────

    /// Enable a channel: connect its adapter and restore pending task
    /// routes from persisted sessions.
    pub async fn enable_channel(&self, channel_type: &str) -> Result<()> {
        let channel = self.require_channel(channel_type).await?;
        let adapter = self.require_adapter(channel_type)?;

        self.channels.set_enabled(&channel.id, true).await?;
        self.channels
            .set_status(&channel.id, ConnectionStatus::Connecting)
            .await?;
        adapter.connect(self.events_tx.clone()).await?;
        self.channels
            .set_status(&channel.id, ConnectionStatus::Connected)
            .await?;

        let restored = self.router.restore_pending_task_routes(channel_type).await?;
        info!(channel = %channel_type, restored, "channel enabled");
        Ok(())
    }

    /// Disable a channel and disconnect its adapter.
    pub async fn disable_channel(&self, channel_type: &str) -> Result<()> {
        let channel = self.require_channel(channel_type).await?;
        if let Some(adapter) = self.registry.get(channel_type)
            && let Err(e) = adapter.disconnect().await
        {
            warn!(channel = %channel_type, error = %e, "adapter disconnect failed");
        }
        self.channels.set_enabled(&channel.id, false).await?;
        self.channels
            .set_status(&channel.id, ConnectionStatus::Disconnected)
            .await?;
        info!(channel = %channel_type, "channel disabled");
        Ok(())
    }

    /// Send a message through a channel's adapter. Returns the protocol
    /// message id.
    pub async fn send_message(
        &self,
        channel_type: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<String> {
        let adapter = self.require_adapter(channel_type)?;
        let message = courier_common::types::OutgoingMessage::text(chat_id, text);
        Ok(adapter.send_message(&message).await?)
    }

    // ── Pairing management ──────────────────────────────────────────────────

    /// Generate a pairing code for a channel (shown to the operator, not
    /// sent over the channel).
    pub async fn generate_pairing_code(&self, channel_type: &str) -> Result<String> {
        let channel = self.require_channel(channel_type).await?;
        // Housekeeping: expired unclaimed codes go away first.
        self.security.sweep_expired_codes(&channel).await?;
        Ok(self.security.generate_pairing_code(&channel).await?)
    }

    /// Verify a pairing code on behalf of a sender (operator-driven flows).
    pub async fn verify_pairing_code(
        &self,
        channel_type: &str,
        user_id: &str,
        code: &str,
    ) -> Result<VerifyOutcome> {
        let channel = self.require_channel(channel_type).await?;
        Ok(self
            .security
            .verify_pairing_code(&channel, user_id, None, code)
            .await?)
    }

    pub async fn list_channel_users(&self, channel_type: &str) -> Result<Vec<ChannelUserRecord>> {
        let channel = self.require_channel(channel_type).await?;
        Ok(self.users.list_by_channel(&channel.id).await?)
    }

    pub async fn grant_access(&self, channel_type: &str, user_id: &str) -> Result<()> {
        let channel = self.require_channel(channel_type).await?;
        Ok(self.security.grant_access(&channel, user_id).await?)
    }

    pub async fn revoke_access(&self, channel_type: &str, user_id: &str) -> Result<()> {
        let channel = self.require_channel(channel_type).await?;
        Ok(self.security.revoke_access(&channel, user_id).await?)
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Disconnect all adapters, stop the tunnel, and clear router state.
    pub async fn shutdown(&self) {
        for channel_type in self.registry.list() {
            if let Some(adapter) = self.registry.get(&channel_type)
                && let Err(e) = adapter.disconnect().await
            {
                warn!(channel = %channel_type, error = %e, "adapter disconnect failed");
            }
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.stop().await;
        }
        self.router.shutdown();
        info!("gateway shut down");
    }

    // ── Lookup helpers ──────────────────────────────────────────────────────

    async fn require_channel(&self, channel_type: &str) -> Result<ChannelRecord> {
        self.channels
            .get_by_type(channel_type)
            .await?
            .ok_or_else(|| Error::UnknownChannel {
                channel_type: channel_type.to_string(),
            })
    }

    fn require_adapter(&self, channel_type: &str) -> Result<Arc<dyn ChannelAdapter>> {
        self.registry
            .get(channel_type)
            .ok_or_else(|| Error::NoAdapter {
                channel_type: channel_type.to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use async_trait::async_trait;

    use {
        courier_channels::adapter::{AdapterStatus, EventSender},
        courier_common::{
            time::now_ms,
            types::{AccessMode, IncomingMessage, OutgoingMessage, SecurityConfig},
        },
        courier_router::{ApprovalOutcome, QueueStatus, TaskSpec},
    };

    use {super::*, crate::config::ChannelConfig};

    struct RecordingAdapter {
        sent: Mutex<Vec<OutgoingMessage>>,
        next_id: AtomicU32,
        connected: Mutex<bool>,
    }

    impl RecordingAdapter {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
                connected: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel_type(&self) -> &str {
            "telegram"
        }

        fn name(&self) -> &str {
            "Recording"
        }

        async fn connect(&self, _events: EventSender) -> courier_channels::Result<()> {
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        async fn disconnect(&self) -> courier_channels::Result<()> {
            *self.connected.lock().unwrap() = false;
            Ok(())
        }

        fn status(&self) -> AdapterStatus {
            AdapterStatus::Connected
        }

        async fn send_message(
            &self,
            message: &OutgoingMessage,
        ) -> courier_channels::Result<String> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
        }
    }

    struct NullEngine;

    #[async_trait]
    impl TaskEngine for NullEngine {
        async fn start_task(&self, _task: TaskSpec) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_message(&self, _task_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cancel_task(&self, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn respond_to_approval(
            &self,
            _approval_id: &str,
            _approved: bool,
        ) -> anyhow::Result<ApprovalOutcome> {
            Ok(ApprovalOutcome::Handled)
        }

        async fn clear_stuck_tasks(&self) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn queue_status(&self) -> anyhow::Result<QueueStatus> {
            Ok(QueueStatus::default())
        }
    }

    fn config_with_channel(mode: AccessMode) -> GatewayConfig {
        GatewayConfig {
            channels: vec![ChannelConfig {
                channel_type: "telegram".into(),
                name: "Main".into(),
                enabled: true,
                security: SecurityConfig {
                    mode,
                    ..Default::default()
                },
                config: serde_json::json!({}),
            }],
            ..Default::default()
        }
    }

    async fn gateway(mode: AccessMode) -> (ChannelGateway, Arc<RecordingAdapter>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let gateway = ChannelGateway::new(pool, Arc::new(NullEngine), config_with_channel(mode))
            .await
            .unwrap();
        let adapter = Arc::new(RecordingAdapter::new());
        gateway.register_adapter(adapter.clone() as Arc<dyn ChannelAdapter>);
        (gateway, adapter)
    }

    #[tokio::test]
    async fn enable_connects_and_disable_disconnects() {
        let (gateway, adapter) = gateway(AccessMode::Open).await;

        gateway.enable_channel("telegram").await.unwrap();
        assert!(*adapter.connected.lock().unwrap());

        gateway.disable_channel("telegram").await.unwrap();
        assert!(!*adapter.connected.lock().unwrap());
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let (gateway, _) = gateway(AccessMode::Open).await;
        assert!(matches!(
            gateway.enable_channel("discord").await,
            Err(Error::UnknownChannel { .. })
        ));
    }

    #[tokio::test]
    async fn send_message_goes_through_adapter() {
        let (gateway, adapter) = gateway(AccessMode::Open).await;
        let id = gateway
            .send_message("telegram", "chat1", "hello")
            .await
            .unwrap();
        assert_eq!(id, "1");
        assert_eq!(adapter.sent.lock().unwrap()[0].text, "hello");
    }

    #[tokio::test]
    async fn pairing_management_roundtrip() {
        let (gateway, _) = gateway(AccessMode::Pairing).await;

        let code = gateway.generate_pairing_code("telegram").await.unwrap();
        assert_eq!(code.len(), 6);

        let outcome = gateway
            .verify_pairing_code("telegram", "alice", &code)
            .await
            .unwrap();
        assert!(outcome.is_success());

        let users = gateway.list_channel_users("telegram").await.unwrap();
        let alice = users
            .iter()
            .find(|u| u.channel_user_id == "alice")
            .unwrap();
        assert!(alice.allowed);

        gateway.revoke_access("telegram", "alice").await.unwrap();
        let users = gateway.list_channel_users("telegram").await.unwrap();
        assert!(!users.iter().find(|u| u.channel_user_id == "alice").unwrap().allowed);

        gateway.grant_access("telegram", "alice").await.unwrap();
        let users = gateway.list_channel_users("telegram").await.unwrap();
        assert!(users.iter().find(|u| u.channel_user_id == "alice").unwrap().allowed);
    }

    #[tokio::test]
    async fn event_loop_routes_inbound_messages() {
        let (gateway, adapter) = gateway(AccessMode::Open).await;
        gateway.enable_channel("telegram").await.unwrap();

        let (engine_tx, engine_rx) = mpsc::channel(8);
        let events_tx = gateway.events_tx.clone();

        let message = IncomingMessage {
            message_id: "m1".into(),
            user_id: "alice".into(),
            user_name: None,
            chat_id: "chat1".into(),
            text: "/help".into(),
            timestamp: now_ms(),
            is_group: false,
            thread_id: None,
            attachments: Vec::new(),
        };
        events_tx
            .send(InboundEvent::Message {
                channel_type: "telegram".into(),
                message,
            })
            .await
            .unwrap();

        // Close both streams so run() drains and returns.
        drop(events_tx);
        drop(engine_tx);
        gateway.run(engine_rx).await;

        // /help produced a reply through the adapter.
        assert!(
            adapter
                .sent
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.text.contains("/status"))
        );
    }
}
