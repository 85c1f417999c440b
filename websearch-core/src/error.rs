//! Error types for websearch-core
//!
//! Remote failures are normalized into this taxonomy at the platform client
//! boundary, so reconciliation and the live monitor never branch on raw HTTP
//! status codes.

use thiserror::Error;

/// Main error type for the websearch-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or unusable configuration, e.g. no platform secret
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad input rejected before any network call
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote platform has no record of the run
    #[error("not found: {0}")]
    NotFound(String),

    /// Credential missing or rejected by the remote platform
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request rejected as malformed (e.g. bad run id)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network, timeout or unexpected HTTP failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transport failures are the only ones worth retrying by user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Short message suitable for showing to a person.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(msg) => format!("Configuration error: {}", msg),
            Error::Transport(msg) if msg.contains("timed out") || msg.contains("timeout") => {
                "Request timeout: The operation took too long to complete".to_string()
            }
            Error::Transport(_) => {
                "Network error: Please check your internet connection and try again".to_string()
            }
            Error::Validation(msg) | Error::InvalidRequest(msg) => msg.clone(),
            Error::NotFound(_) => "Task not found on server".to_string(),
            Error::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            other => other.to_string(),
        }
    }
}

/// Failures of the key/value persistence layer.
///
/// These never cross the history API: the history store absorbs them,
/// logs the condition and reports "not saved".
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage is disabled or cannot be opened
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Writing would exceed the configured capacity
    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    /// Any other backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Result type alias for websearch-core
pub type Result<T> = std::result::Result<T, Error>;
