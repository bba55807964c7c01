//! Error types for the points server.

use pointsync_protocol::{CounterValue, EntityKey, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the points server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A deduction larger than the balance.
    #[error("insufficient points for {key}: balance {balance}, requested {requested}")]
    InsufficientPoints {
        /// Account key.
        key: EntityKey,
        /// Current balance.
        balance: CounterValue,
        /// Amount requested.
        requested: CounterValue,
    },

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The store is temporarily unable to answer.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::NotAuthorized(_)
                | ServerError::InsufficientPoints { .. }
                | ServerError::Protocol(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Unavailable(_) | ServerError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Unavailable("busy".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::InsufficientPoints {
            key: EntityKey::from("user-1"),
            balance: 10,
            requested: 25,
        };
        let msg = err.to_string();
        assert!(msg.contains("user-1"));
        assert!(msg.contains("10"));
        assert!(msg.contains("25"));
    }
}
