/// Crate-wide result type for security operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Security-layer errors. Denials are not errors; they are reported through
/// [`crate::AccessDecision`] and [`crate::VerifyOutcome`]. Only real I/O
/// failures surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] courier_store::Error),
}
