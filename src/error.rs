//! Error taxonomy for the engine.
//!
//! Every public operation returns `Result<T, EngineError>`. All variants are
//! recoverable from the caller's point of view; a `NotFound` raised while
//! closing a session is the signal that the session record vanished
//! out-of-band and that the recovery path applies. The engine never decides
//! that on its own.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input: non-positive amount, empty required field, unusable config.
    #[error("validation: {0}")]
    Validation(String),

    /// Operation is illegal for the current session status.
    #[error("state: {0}")]
    State(String),

    /// Would violate the one-open-session-per-register invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requester is neither the session owner nor privileged.
    #[error("permission: {0}")]
    Permission(String),

    /// Referenced session, register, or transaction does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying SQLite failure.
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),

    /// Failed to serialize a persisted summary document.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl EngineError {
    /// True when the error identifies a missing record, the trigger for the
    /// deleted-session recovery flow after a failed close.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}
