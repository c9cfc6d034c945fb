//! Error types for setstore
//!
//! This module defines the error taxonomy shared by the engine and the CLI.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for setstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for setstore
#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "quota exceeded for namespace '{namespace}': {requested} bytes requested, limit {limit} bytes"
    )]
    QuotaExceeded {
        namespace: String,
        requested: usize,
        limit: usize,
    },

    // Persistence errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("corrupt state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    // Internal errors
    #[error("setting ids exhausted")]
    IdsExhausted,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a corrupt state error for the given file
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if the mutation was rejected by the namespace quota
    #[must_use]
    pub const fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Check if this error came from a malformed state file
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptState { .. })
    }

    /// Check if retrying the same operation later can succeed.
    ///
    /// Only write-side failures qualify: the in-memory state stays dirty
    /// and a later flush picks it up again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Persistence(_))
    }
}
