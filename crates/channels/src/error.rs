use std::error::Error as StdError;

/// Crate-wide result type for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors shared across adapter traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is invalid.
    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    /// A requested channel type is not registered.
    #[error("unknown channel: {channel_type}")]
    UnknownChannel { channel_type: String },

    /// The adapter does not implement an optional capability.
    #[error("channel capability not supported: {capability}")]
    Unsupported { capability: String },

    /// Operation is currently unavailable (not connected/configured).
    #[error("channel unavailable: {message}")]
    Unavailable { message: String },

    /// Outbound delivery failed at the protocol layer.
    #[error("channel delivery failed: {context}: {source}")]
    Delivery {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_channel(channel_type: impl std::fmt::Display) -> Self {
        Self::UnknownChannel {
            channel_type: channel_type.to_string(),
        }
    }

    #[must_use]
    pub fn unsupported(capability: impl std::fmt::Display) -> Self {
        Self::Unsupported {
            capability: capability.to_string(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn delivery(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Delivery {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
