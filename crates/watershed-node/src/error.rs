//! Error types for the lending node.

use thiserror::Error;
use watershed_ledger::LedgerError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No or invalid caller identity
    #[error("Unauthorized")]
    Unauthorized,

    /// Loan or account missing
    #[error("{0}")]
    NotFound(String),

    /// Caller does not own the resource
    #[error("{0}")]
    Forbidden(String),

    /// Amount, term or purpose out of bounds
    #[error("{0}")]
    Validation(String),

    /// Balance floor not met or conflicting open loan
    #[error("{0}")]
    Ineligible(String),

    /// Operation not allowed in the loan's current status
    #[error("{0}")]
    InvalidState(String),

    /// Ledger invariant would break; treated as internal
    #[error("Ledger invariant violated: {0}")]
    Invariant(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures the caller cannot fix by changing the request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Invariant(_)
                | Error::Storage(_)
                | Error::Serialization(_)
                | Error::Io(_)
                | Error::Config(_)
        )
    }
}

impl From<LedgerError> for Error {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation(msg) => Error::Validation(msg),
            LedgerError::Ineligible(reason) => Error::Ineligible(reason.to_string()),
            e @ LedgerError::InvalidState { .. } => Error::InvalidState(e.to_string()),
            e @ LedgerError::InsufficientBalance { .. } => Error::Ineligible(e.to_string()),
            LedgerError::Invariant(msg) => Error::Invariant(msg),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
