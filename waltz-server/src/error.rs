//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] waltz_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unknown partition: {0}")]
    UnknownPartition(i32),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("write timed out")]
    WriteTimeout,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether the connection that raised this error must be closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Protocol(e) => e.is_fatal(),
            ServerError::InvalidRequest(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waltz_protocol::ProtocolError;

    #[test]
    fn test_fatal_classification() {
        assert!(!ServerError::from(ProtocolError::corrupt("bad crc")).is_fatal());
        assert!(ServerError::from(ProtocolError::UnsupportedProtocol {
            magic: b'A',
            version: 0
        })
        .is_fatal());
        assert!(!ServerError::InvalidRequest("response sent by client".into()).is_fatal());
        assert!(ServerError::UnknownPartition(9).is_fatal());
    }
}
