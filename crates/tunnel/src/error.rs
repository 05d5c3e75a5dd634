/// Crate-wide result type for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Tunnel failures. These surface to whoever requested the tunnel and never
/// affect unrelated channels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The provider CLI binary is not installed or not on PATH.
    #[error("tunnel provider '{provider}' not found: {hint}")]
    ProviderMissing { provider: String, hint: String },

    /// The provider did not report a public URL in time.
    #[error("tunnel provider '{provider}' produced no URL within {waited_secs}s")]
    Timeout { provider: String, waited_secs: u64 },

    /// The provider process exited before a URL was discovered.
    #[error("tunnel provider '{provider}' exited early (code {code:?})")]
    ExitedEarly { provider: String, code: Option<i32> },

    /// Spawning or signalling the provider process failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The ngrok local status API failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Provider status output could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
