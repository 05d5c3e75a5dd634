/// Crate-wide result type for routing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Routing errors. Failures inside one chat's handling are caught at the
/// event boundary and converted to a best-effort reply; they never abort
/// processing of other chats.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] courier_store::Error),

    #[error(transparent)]
    Security(#[from] courier_security::Error),

    #[error(transparent)]
    Sessions(#[from] courier_sessions::Error),

    #[error(transparent)]
    Channel(#[from] courier_channels::Error),

    /// The task engine rejected or failed an operation.
    #[error("task engine error: {0}")]
    Engine(#[from] anyhow::Error),
}
