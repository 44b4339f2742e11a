//! Error types for the recordset engine.

use crate::sync::SyncError;
use thiserror::Error;

/// All possible errors from the recordset engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Configuration errors
    #[error("no URL configured for {0}")]
    MissingUrl(String),

    #[error("no sync adapter configured")]
    MissingAdapter,

    #[error("store is virtualized; use {0}_async")]
    VirtualizedStore(&'static str),

    #[error("comparator not supported: {0}")]
    UnsupportedComparator(String),

    #[error("comparator '{operator}' on '{attribute}' can only be evaluated by the server")]
    ServerOnlyComparator { attribute: String, operator: String },

    #[error("comparator on '{0}' can only be evaluated locally")]
    LocalOnlyComparator(String),

    // Validation errors
    #[error("validation failed: {0}")]
    Validation(serde_json::Value),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Lookup errors
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    // Remote errors
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("request aborted")]
    Aborted,

    #[error("operation cancelled before completion")]
    Cancelled,
}

impl Error {
    /// Whether this error stems from store or record configuration rather
    /// than from the data or the transport.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingUrl(_)
                | Error::MissingAdapter
                | Error::VirtualizedStore(_)
                | Error::UnsupportedComparator(_)
                | Error::ServerOnlyComparator { .. }
                | Error::LocalOnlyComparator(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
