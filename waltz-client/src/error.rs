//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] waltz_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection already opened")]
    AlreadyOpened,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A response arrived for a sequence number with no pending call.
    #[error("orphan response for seq {seq_num}")]
    OrphanResponse { seq_num: i64 },

    /// An append was rejected by the lock table.
    #[error("lock failure on partition {partition_id}: conflicting transaction {transaction_id}")]
    LockFailure {
        partition_id: i32,
        transaction_id: i64,
    },

    /// The peer answered the call with a failure.
    #[error("remote call failed: {0}")]
    Rpc(String),

    #[error("unexpected response message type {0}")]
    UnexpectedResponse(i8),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed
                | ClientError::LockFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::LockFailure {
            partition_id: 0,
            transaction_id: 3
        }
        .is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::HandshakeRejected("no".into()).is_retryable());
        assert!(!ClientError::Protocol(waltz_protocol::ProtocolError::corrupt("x")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ClientError::LockFailure {
            partition_id: 2,
            transaction_id: 17,
        };
        let msg = err.to_string();
        assert!(msg.contains("partition 2"));
        assert!(msg.contains("17"));
    }
}
