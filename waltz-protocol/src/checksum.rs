//! Integrity codes for opaque transaction data.
//!
//! The same function is used when a transaction is appended and whenever its
//! data travels back over the wire, so a checksum computed once by the
//! producer stays valid for the record's lifetime.

use crate::error::ProtocolError;

/// Computes the checksum of a data payload (CRC32C, reinterpreted as `i32`).
pub fn compute(data: &[u8]) -> i32 {
    crc32c::crc32c(data) as i32
}

/// Verifies that `checksum` matches `data`.
///
/// `message_type` identifies the carrying message in the error.
pub fn verify(message_type: i8, data: &[u8], checksum: i32) -> Result<(), ProtocolError> {
    let actual = compute(data);
    if actual != checksum {
        return Err(ProtocolError::corrupt(format!(
            "checksum mismatch: expected {:#010x}, got {:#010x}",
            checksum as u32, actual as u32
        ))
        .with_message_type(message_type));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        assert_eq!(compute(b"transaction"), compute(b"transaction"));
        assert_ne!(compute(b"transaction"), compute(b"transactioN"));
    }

    #[test]
    fn test_known_value() {
        // CRC32C check value for "123456789".
        assert_eq!(compute(b"123456789") as u32, 0xE306_9283);
    }

    #[test]
    fn test_verify_ok() {
        let data = b"payload";
        assert!(verify(2, data, compute(data)).is_ok());
        assert!(verify(2, b"", compute(b"")).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let data = b"payload";
        let err = verify(7, data, compute(data) ^ 1).unwrap_err();
        match err {
            ProtocolError::CorruptMessage { message_type, .. } => {
                assert_eq!(message_type, Some(7))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
