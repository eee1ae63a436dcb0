//! Error taxonomy shared across components.
//!
//! Each kind below carries a stable `code()` string so the Hub, Dispatcher
//! and Consumer can translate a single typed error into their own wire
//! representation (WS close code, HTTP status, outbox status transition)
//! without re-deriving the classification at each call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authorization: {0}")]
    Authorization(String),

    #[error("overload: {0}")]
    Overload(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Stable machine-readable code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::Authorization(_) => "unauthorized",
            CoreError::Overload(_) => "overloaded",
            CoreError::Conflict(_) => "conflict",
            CoreError::Crypto(_) => "crypto_error",
            CoreError::Transient(_) => "transient_error",
            CoreError::Fatal(_) => "fatal_error",
        }
    }

    /// Whether a caller should retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::Overload(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
