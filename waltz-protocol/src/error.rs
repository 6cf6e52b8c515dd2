//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while framing, encoding or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol: magic {magic:#04x}, version {version}")]
    UnsupportedProtocol { magic: u8, version: u16 },

    #[error("unknown message type: {0}")]
    UnknownMessageType(i8),

    #[error("corrupt message: {reason}")]
    CorruptMessage {
        /// Type tag of the message being decoded, when known.
        message_type: Option<i8>,
        /// Sequence number of the message being decoded, when known.
        seq_num: Option<i64>,
        reason: String,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a corruption error with no message context.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        ProtocolError::CorruptMessage {
            message_type: None,
            seq_num: None,
            reason: reason.into(),
        }
    }

    /// Attaches the message type to a corruption error.
    pub fn with_message_type(self, message_type: i8) -> Self {
        match self {
            ProtocolError::CorruptMessage {
                seq_num, reason, ..
            } => ProtocolError::CorruptMessage {
                message_type: Some(message_type),
                seq_num,
                reason,
            },
            other => other,
        }
    }

    /// Attaches the sequence number of the call a corruption error belongs to.
    pub fn with_seq_num(self, seq_num: i64) -> Self {
        match self {
            ProtocolError::CorruptMessage {
                message_type,
                reason,
                ..
            } => ProtocolError::CorruptMessage {
                message_type,
                seq_num: Some(seq_num),
                reason,
            },
            other => other,
        }
    }

    /// Sequence number of the call this error can be attributed to.
    pub fn seq_num(&self) -> Option<i64> {
        match self {
            ProtocolError::CorruptMessage { seq_num, .. } => *seq_num,
            _ => None,
        }
    }

    /// Returns whether the byte stream can no longer be trusted after this error.
    ///
    /// Corrupt and unknown messages consume exactly one frame, so the stream
    /// stays aligned. A bad header leaves no way to find the next frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnsupportedProtocol { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnsupportedProtocol {
            magic: b'X',
            version: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x58"));
        assert!(msg.contains('9'));

        let err = ProtocolError::UnknownMessageType(-3);
        assert!(err.to_string().contains("-3"));

        let err = ProtocolError::UnsupportedOperation("append locks".to_string());
        assert!(err.to_string().contains("append locks"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn test_corrupt_context() {
        let err = ProtocolError::corrupt("checksum mismatch")
            .with_message_type(7)
            .with_seq_num(42);
        assert_eq!(err.seq_num(), Some(42));
        match err {
            ProtocolError::CorruptMessage {
                message_type,
                reason,
                ..
            } => {
                assert_eq!(message_type, Some(7));
                assert_eq!(reason, "checksum mismatch");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_context_ignored_on_other_errors() {
        let err = ProtocolError::UnknownMessageType(99).with_seq_num(5);
        assert_eq!(err.seq_num(), None);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::UnsupportedProtocol {
            magic: 0,
            version: 0
        }
        .is_fatal());
        assert!(ProtocolError::FrameTooLarge { size: 1, max: 0 }.is_fatal());
        assert!(!ProtocolError::corrupt("x").is_fatal());
        assert!(!ProtocolError::UnknownMessageType(1).is_fatal());
    }
}
