//! Hello handshake exchanged before any plane message.
//!
//! The client announces which plane it wants to speak (by magic byte) and
//! the codec versions it can use. The server picks one or refuses.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::wire::{AttributeReader, AttributeWriter};
use crate::{HANDSHAKE_MAGIC, HANDSHAKE_VERSION};
use bytes::{Bytes, BytesMut};

/// Default idle read timeout announced in a hello.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 30;

/// Default liveness timeout announced in a hello.
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u32 = 60;

const RESPONSE_ACCEPTED: i8 = 0;
const RESPONSE_REJECTED: i8 = 1;

/// Connection-opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Magic byte of the plane the client wants to speak.
    pub magic: u8,
    /// Codec versions the client supports.
    pub versions: Vec<u16>,
    /// Human-readable client description.
    pub hello: String,
    pub idle_timeout_secs: u32,
    pub liveness_timeout_secs: u32,
}

impl Hello {
    pub fn new(magic: u8, versions: Vec<u16>, hello: impl Into<String>) -> Self {
        Self {
            magic,
            versions,
            hello: hello.into(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            liveness_timeout_secs: DEFAULT_LIVENESS_TIMEOUT_SECS,
        }
    }

    pub fn with_timeouts(mut self, idle_timeout_secs: u32, liveness_timeout_secs: u32) -> Self {
        self.idle_timeout_secs = idle_timeout_secs;
        self.liveness_timeout_secs = liveness_timeout_secs;
        self
    }

    /// Picks the highest version both sides support, if the plane matches.
    pub fn negotiate(&self, magic: u8, supported: &[u16]) -> Option<u16> {
        if self.magic != magic {
            return None;
        }
        self.versions
            .iter()
            .copied()
            .filter(|v| supported.contains(v))
            .max()
    }

    /// Encodes the hello into a handshake frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        let mut writer = AttributeWriter::new(&mut payload);
        writer.write_byte(self.magic as i8);
        let versions: Vec<i32> = self.versions.iter().map(|v| i32::from(*v)).collect();
        writer.write_int_array(&versions);
        writer.write_string(&self.hello);
        writer.write_int(self.idle_timeout_secs as i32);
        writer.write_int(self.liveness_timeout_secs as i32);
        Frame::new(HANDSHAKE_MAGIC, HANDSHAKE_VERSION, payload.freeze()).encode()
    }

    /// Decodes a hello from a handshake frame payload.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = AttributeReader::new(payload);
        let magic = reader.read_byte()? as u8;
        let versions = reader
            .read_int_array()?
            .into_iter()
            .map(|v| {
                u16::try_from(v)
                    .map_err(|_| ProtocolError::corrupt(format!("invalid codec version: {}", v)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let hello = reader.read_string()?;
        let idle_timeout_secs = reader.read_int()? as u32;
        let liveness_timeout_secs = reader.read_int()? as u32;
        reader.finish()?;
        Ok(Self {
            magic,
            versions,
            hello,
            idle_timeout_secs,
            liveness_timeout_secs,
        })
    }
}

/// Server answer to a [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloResponse {
    Accepted { version: u16 },
    Rejected { reason: String },
}

impl HelloResponse {
    /// Encodes the response into a handshake frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        let mut writer = AttributeWriter::new(&mut payload);
        match self {
            HelloResponse::Accepted { version } => {
                writer.write_byte(RESPONSE_ACCEPTED);
                writer.write_int(i32::from(*version));
            }
            HelloResponse::Rejected { reason } => {
                writer.write_byte(RESPONSE_REJECTED);
                writer.write_string(reason);
            }
        }
        Frame::new(HANDSHAKE_MAGIC, HANDSHAKE_VERSION, payload.freeze()).encode()
    }

    /// Decodes a response from a handshake frame payload.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = AttributeReader::new(payload);
        let response = match reader.read_byte()? {
            RESPONSE_ACCEPTED => {
                let version = reader.read_int()?;
                let version = u16::try_from(version).map_err(|_| {
                    ProtocolError::corrupt(format!("invalid codec version: {}", version))
                })?;
                HelloResponse::Accepted { version }
            }
            RESPONSE_REJECTED => HelloResponse::Rejected {
                reason: reader.read_string()?,
            },
            other => {
                return Err(ProtocolError::corrupt(format!(
                    "invalid hello response kind: {}",
                    other
                )))
            }
        };
        reader.finish()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ADMIN_MAGIC, MESSAGE_MAGIC};

    fn payload_of(mut encoded: BytesMut) -> Bytes {
        Frame::decode(&mut encoded).unwrap().unwrap().payload
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello::new(MESSAGE_MAGIC, vec![1], "Waltz Client").with_timeouts(5, 10);
        let frame = hello.encode().unwrap();
        assert_eq!(frame[0], HANDSHAKE_MAGIC);

        let decoded = Hello::decode(payload_of(frame)).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_default_timeouts() {
        let hello = Hello::new(ADMIN_MAGIC, vec![0], "Waltz Storage Admin Client");
        assert_eq!(hello.idle_timeout_secs, 30);
        assert_eq!(hello.liveness_timeout_secs, 60);
    }

    #[test]
    fn test_negotiate() {
        let hello = Hello::new(MESSAGE_MAGIC, vec![0, 1, 3], "client");
        assert_eq!(hello.negotiate(MESSAGE_MAGIC, &[1, 2]), Some(1));
        assert_eq!(hello.negotiate(MESSAGE_MAGIC, &[0, 1, 3]), Some(3));
        assert_eq!(hello.negotiate(MESSAGE_MAGIC, &[2]), None);
        assert_eq!(hello.negotiate(ADMIN_MAGIC, &[1]), None);
    }

    #[test]
    fn test_response_roundtrip() {
        for response in [
            HelloResponse::Accepted { version: 1 },
            HelloResponse::Rejected {
                reason: "unsupported version".to_string(),
            },
        ] {
            let decoded = HelloResponse::decode(payload_of(response.encode().unwrap())).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_response_bad_kind() {
        let result = HelloResponse::decode(Bytes::from_static(&[7]));
        assert!(matches!(result, Err(ProtocolError::CorruptMessage { .. })));
    }
}
