//! Error types for Stubvault

use std::io;

use hyper::StatusCode;
use thiserror::Error;

/// Result type for Stubvault operations
pub type Result<T> = std::result::Result<T, StubvaultError>;

/// Errors that can occur in Stubvault
#[derive(Debug, Error)]
pub enum StubvaultError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Named entry absent from a storage backend
    #[error("Not found: {0}")]
    NotFound(String),

    /// Named snapshot absent when restoring
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Network or authentication failure talking to a backend
    #[error("Storage unavailable ({backend}): {reason}")]
    StorageUnavailable {
        /// Backend label
        backend: String,
        /// Failure description
        reason: String,
    },

    /// Malformed or unsafe archive contents
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Recording start while a session is active
    #[error("Recording already in progress (upstream: {upstream})")]
    AlreadyRecording {
        /// Upstream of the active session
        upstream: String,
    },

    /// Recording stop while idle
    #[error("Recording is not active")]
    NotRecording,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Snapshot name unusable as a storage key
    #[error("Invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    /// Mapping document that cannot be used
    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    /// Request/response/archive too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Snapshot operation failure with its target attached
    #[error("Failed to {operation} snapshot '{name}' on {backend}: {source}")]
    Snapshot {
        /// Operation name (create, restore, ...)
        operation: &'static str,
        /// Snapshot name
        name: String,
        /// Backend label
        backend: String,
        /// Underlying failure
        #[source]
        source: Box<StubvaultError>,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl StubvaultError {
    /// Build a `StorageUnavailable` error
    pub fn unavailable(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// The innermost error, looking through `Snapshot` context
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Snapshot { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status class reported to API callers
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            Self::NotFound(_) | Self::SnapshotNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRecording { .. } | Self::NotRecording => StatusCode::CONFLICT,
            Self::ConfigError(_) | Self::InvalidSnapshotName(_) | Self::InvalidMapping(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
