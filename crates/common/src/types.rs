use serde::{Deserialize, Serialize};

// ── Chat / message types ────────────────────────────────────────────────────

/// Kind of conversation a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dm,
    Group,
    Channel,
}

/// A message delivered by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub chat_id: String,
    pub text: String,
    /// Epoch milliseconds at which the adapter received the message.
    pub timestamp: i64,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl IncomingMessage {
    pub fn chat_type(&self) -> ChatType {
        if self.is_group {
            ChatType::Group
        } else {
            ChatType::Dm
        }
    }
}

/// A file or media item attached to an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub url: Option<String>,
}

/// A message to be delivered through a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<InlineKeyboard>,
}

impl OutgoingMessage {
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }
}

/// An inline keyboard rendered under an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

/// A single pressable inline button carrying opaque callback data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineButton {
    pub label: String,
    pub data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// A button press relayed by an adapter that supports inline keyboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub callback_id: String,
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub data: String,
}

// ── Channel security configuration ──────────────────────────────────────────

/// Trust mode for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Every sender is allowed.
    Open,
    /// Only senders on the allowlist (or already promoted) are allowed.
    Allowlist,
    /// Senders must redeem a pairing code before they are allowed.
    #[default]
    Pairing,
}

/// Per-channel security settings, stored as a JSON blob on the channel row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub mode: AccessMode,
    /// Seconds a generated pairing code stays redeemable.
    pub pairing_code_ttl_secs: i64,
    /// Wrong-code attempts before lockout.
    pub max_pairing_attempts: u32,
    /// Inbound messages allowed per sender per minute. Zero disables the limit.
    pub rate_limit_per_minute: u32,
    /// Senders allowed without pairing when mode is `allowlist`.
    pub allowed_users: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: AccessMode::Pairing,
            pairing_code_ttl_secs: 300,
            max_pairing_attempts: 5,
            rate_limit_per_minute: 0,
            allowed_users: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn security_config_defaults() {
        let cfg: SecurityConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, AccessMode::Pairing);
        assert_eq!(cfg.pairing_code_ttl_secs, 300);
        assert_eq!(cfg.max_pairing_attempts, 5);
        assert_eq!(cfg.rate_limit_per_minute, 0);
        assert!(cfg.allowed_users.is_empty());
    }

    #[test]
    fn access_mode_roundtrip() {
        let json = serde_json::to_string(&AccessMode::Allowlist).unwrap();
        assert_eq!(json, "\"allowlist\"");
        let mode: AccessMode = serde_json::from_str("\"open\"").unwrap();
        assert_eq!(mode, AccessMode::Open);
    }

    #[test]
    fn chat_type_from_message() {
        let msg = IncomingMessage {
            message_id: "1".into(),
            user_id: "u".into(),
            user_name: None,
            chat_id: "c".into(),
            text: "hi".into(),
            timestamp: 0,
            is_group: true,
            thread_id: None,
            attachments: Vec::new(),
        };
        assert_eq!(msg.chat_type(), ChatType::Group);
    }
}
