/// Crate-wide result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A row that was expected to exist is missing.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Underlying database failure.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }
}
