// src/core/errors.rs

//! Defines the primary error type for the crate.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// The main error enum, representing all failures the client can surface.
///
/// The variants fall into three families: configuration errors (fatal,
/// surfaced immediately, never retried), connectivity errors (retried only
/// by the connection manager during initialization), and protocol errors
/// (a well-formed reply the client cannot interpret).
#[derive(Error, Debug)]
pub enum StoreError {
    // --- Configuration ---
    #[error("Invalid configuration: {0}")]
    Config(String),

    // --- Connectivity ---
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection pool exhausted (limit: {0})")]
    PoolExhausted(usize),

    #[error("Connection pool is closed")]
    PoolClosed,

    /// An error reply from the store, e.g. a failed `AUTH`.
    #[error("Server error: {0}")]
    Server(String),

    // --- Protocol ---
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected reply to '{command}': {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    // --- Usage ---
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether the connection manager's retry policy applies to this error.
    /// Configuration and usage errors are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::Config(_) | StoreError::InvalidArgument(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for StoreError {
    fn clone(&self) -> Self {
        match self {
            StoreError::Config(s) => StoreError::Config(s.clone()),
            StoreError::Io(e) => StoreError::Io(Arc::clone(e)),
            StoreError::Timeout(d) => StoreError::Timeout(*d),
            StoreError::ConnectionClosed => StoreError::ConnectionClosed,
            StoreError::PoolExhausted(n) => StoreError::PoolExhausted(*n),
            StoreError::PoolClosed => StoreError::PoolClosed,
            StoreError::Server(s) => StoreError::Server(s.clone()),
            StoreError::IncompleteData => StoreError::IncompleteData,
            StoreError::Protocol(s) => StoreError::Protocol(s.clone()),
            StoreError::UnexpectedReply { command, reply } => StoreError::UnexpectedReply {
                command,
                reply: reply.clone(),
            },
            StoreError::InvalidArgument(s) => StoreError::InvalidArgument(s.clone()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}
