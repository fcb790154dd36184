// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the manager.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ManagerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    /// A retryable RPC failure: connection refused, timeout, or a 5xx answer.
    #[error("Transient RPC error: {0}")]
    Transient(String),

    /// The node reports a conflicting operation, e.g. an active repair.
    #[error("Remote busy: {0}")]
    RemoteBusy(String),

    /// An agent-side asynchronous job reported failure.
    #[error("Agent job error: {0}")]
    Job(String),

    /// A structural problem that makes the run impossible, e.g. a malformed
    /// ring or empty replication for the selected datacenters.
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("repair finished with {0} failed segments")]
    SegmentsFailed(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// True for failures that a bounded retry with backoff may resolve.
    pub fn is_transient(&self) -> bool {
        match self {
            ManagerError::Transient(_) => true,
            ManagerError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ManagerError::Cancelled)
    }

    /// True when the underlying IO stream was closed mid-handshake.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, ManagerError::Io(e) if e.kind() == ErrorKind::UnexpectedEof)
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ManagerError {
    fn from(e: std::io::Error) -> Self {
        ManagerError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for ManagerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return ManagerError::Transient(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.is_server_error() {
                return ManagerError::Transient(e.to_string());
            }
        }
        ManagerError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(e: serde_json::Error) -> Self {
        ManagerError::Json(e.to_string())
    }
}

impl From<uuid::Error> for ManagerError {
    fn from(e: uuid::Error) -> Self {
        ManagerError::Validation(format!("invalid identifier: {e}"))
    }
}
