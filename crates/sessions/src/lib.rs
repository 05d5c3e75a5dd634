//! Session lifecycle: one durable record per `(channel, chat)` conversation.

pub mod manager;

pub use manager::SessionManager;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Session-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] courier_store::Error),
}
