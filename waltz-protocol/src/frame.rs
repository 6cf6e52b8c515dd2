//! Binary frame format.
//!
//! Frame layout (11 bytes header + payload):
//!
//! ```text
//! +--------+---------+-------------+--------+------------------+
//! | magic  | version | payload_len | crc32c | payload          |
//! | 1 byte | 2 bytes |   4 bytes   | 4 bytes| payload_len bytes|
//! +--------+---------+-------------+--------+------------------+
//! ```
//!
//! The magic byte selects the message plane (`'L'` data, `'A'` admin,
//! `'H'` handshake) and the version selects the codec for that plane.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (1+2+4+4 = 11).
pub const FRAME_HEADER_SIZE: usize = 11;

/// Fixed header fields, readable before the payload has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub version: u16,
    pub payload_len: u32,
    pub crc: u32,
}

impl FrameHeader {
    /// Reads the header at the front of `buf` without consuming it.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: buf[0],
            version: u16::from_be_bytes([buf[1], buf[2]]),
            payload_len: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            crc: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: u8,
    pub version: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(magic: u8, version: u16, payload: Bytes) -> Self {
        Self {
            magic,
            version,
            payload,
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        Self::encode_parts(self.magic, self.version, &self.payload, &mut buf)?;
        Ok(buf)
    }

    /// Appends a frame built from its parts to `buf`.
    pub fn encode_parts(
        magic: u8,
        version: u16,
        payload: &[u8],
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(magic);
        buf.put_u16(version);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(crc32c::crc32c(payload));
        buf.put_slice(payload);
        Ok(())
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// A CRC mismatch consumes the frame so the next one can still be read.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let header = match FrameHeader::peek(buf) {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: header.payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total_len = FRAME_HEADER_SIZE + header.payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.payload_len as usize).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != header.crc {
            return Err(ProtocolError::corrupt(format!(
                "frame crc mismatch: expected {:#010x}, got {:#010x}",
                header.crc, crc_actual
            )));
        }

        Ok(Some(Self {
            magic: header.magic,
            version: header.version,
            payload,
        }))
    }
}
