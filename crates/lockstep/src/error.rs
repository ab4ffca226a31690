//! Error types for lockstep.

use thiserror::Error;
use uuid::Uuid;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lockstep operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Enqueue input was rejected before anything was written.
    #[error("invalid event: {0}")]
    Validation(String),

    /// The event is not in the processing table.
    ///
    /// Raised when completing an event whose lease was already reclaimed, or
    /// when the same event is completed twice. Under at-least-once delivery
    /// this is an expected race rather than a fault.
    #[error("event {0} is not being processed")]
    NotFound(Uuid),

    /// A stored payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored timestamp is outside the representable range.
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),

    /// SQLite storage error.
    ///
    /// Every mutation runs inside one transaction, so a store error means
    /// nothing was written. Scheduler and reclaimer ticks retry on their next
    /// interval.
    #[cfg(feature = "sqlite")]
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Applying the embedded schema migrations failed.
    #[cfg(feature = "sqlite")]
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation(reason.into())
    }

    /// Returns `true` if the failure is expected to clear on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            Error::Store(_) => true,
            _ => false,
        }
    }
}
