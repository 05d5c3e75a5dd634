use {
    async_trait::async_trait,
    courier_common::types::{CallbackQuery, IncomingMessage, OutgoingMessage},
    tokio::sync::mpsc,
};

use crate::{Error, Result};

/// Connection health reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AdapterStatus {
    Disconnected,
    Connecting,
    Connected,
    Error { message: String },
}

/// Events an adapter pushes into the gateway.
///
/// Adapters deliver events for one chat in order; the gateway interleaves
/// events from different chats freely.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message {
        channel_type: String,
        message: IncomingMessage,
    },
    Callback {
        channel_type: String,
        query: CallbackQuery,
    },
    StatusChange {
        channel_type: String,
        status: AdapterStatus,
    },
    Error {
        channel_type: String,
        message: String,
    },
}

/// Sender half adapters use to push [`InboundEvent`]s to the gateway.
pub type EventSender = mpsc::Sender<InboundEvent>;

/// Core adapter trait. Each messaging protocol implements this.
///
/// Optional capabilities default to "not supported"; the router probes them
/// instead of downcasting to concrete adapter types.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel identifier (e.g. "telegram", "discord").
    fn channel_type(&self) -> &str;

    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Open the protocol connection and start delivering inbound events.
    async fn connect(&self, events: EventSender) -> Result<()>;

    /// Close the protocol connection.
    async fn disconnect(&self) -> Result<()>;

    /// Current connection health.
    fn status(&self) -> AdapterStatus;

    /// Deliver a message. Returns the protocol message id.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<String>;

    /// Whether the protocol renders inline keyboards and emits callbacks.
    fn supports_inline_keyboards(&self) -> bool {
        false
    }

    /// Whether streamed responses can be edited in place (draft stream).
    fn supports_draft_stream(&self) -> bool {
        false
    }

    /// Replace the text of an already-sent message.
    async fn edit_message(&self, _chat_id: &str, _message_id: &str, _text: &str) -> Result<()> {
        Err(Error::unsupported("edit_message"))
    }

    /// Acknowledge an inline-keyboard callback, optionally with a toast.
    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Send a "typing" indicator. No-op by default.
    async fn send_typing(&self, _chat_id: &str) -> Result<()> {
        Ok(())
    }
}
