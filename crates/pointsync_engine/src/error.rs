//! Error types for the synchronizer.

use thiserror::Error;

/// Result type for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by a [`SnapshotFetcher`](crate::SnapshotFetcher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The store has no record for the key.
    ///
    /// The synchronizer treats this as a value of zero, never as a failure.
    #[error("no record for key")]
    NotFound,

    /// Network or store failure that may clear up on retry.
    #[error("transient fetch failure: {message}")]
    Transient {
        /// Error message.
        message: String,
    },

    /// The fetch did not complete within the configured timeout.
    #[error("snapshot fetch timed out")]
    Timeout,

    /// The store refused the read (bad credentials, malformed request).
    #[error("snapshot rejected: {message}")]
    Rejected {
        /// Error message.
        message: String,
    },
}

impl FetchError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. } | FetchError::Timeout)
    }
}

/// Errors produced by a change stream or while opening one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// An open stream lost its connection.
    #[error("stream disconnected: {reason}")]
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },

    /// The transport could not open a stream.
    #[error("failed to open stream: {message}")]
    OpenFailed {
        /// Error message.
        message: String,
    },

    /// A frame on the stream could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Creates a disconnect error.
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Creates an open failure.
    pub fn open_failed(message: impl Into<String>) -> Self {
        Self::OpenFailed {
            message: message.into(),
        }
    }
}

/// Errors surfaced to callers of the synchronizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The initial snapshot for a subscription failed.
    #[error("snapshot failed: {0}")]
    Fetch(#[from] FetchError),

    /// The subscription was torn down before it finished resolving.
    #[error("subscription cancelled")]
    Cancelled,

    /// The synchronizer has been torn down.
    #[error("synchronizer shut down")]
    Shutdown,

    /// An empty key was passed to `subscribe`.
    #[error("entity key must not be empty")]
    EmptyKey,
}

impl SyncError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch(e) => e.is_retryable(),
            SyncError::Cancelled => true,
            SyncError::Shutdown | SyncError::EmptyKey => false,
        }
    }
}
