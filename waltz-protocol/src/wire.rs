//! Primitive attribute encoding shared by every codec.
//!
//! Integers are fixed width and big-endian. Arrays, byte arrays and strings
//! carry an `i32` length prefix. Booleans take one byte.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Writes message attributes into a buffer.
pub struct AttributeWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> AttributeWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn write_byte(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_int(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_long(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_int_array(&mut self, values: &[i32]) {
        self.buf.put_i32(values.len() as i32);
        for value in values {
            self.buf.put_i32(*value);
        }
    }

    pub fn write_byte_array(&mut self, data: &[u8]) {
        self.buf.put_i32(data.len() as i32);
        self.buf.put_slice(data);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }

    pub fn write_uuid(&mut self, value: &Uuid) {
        let (high, low) = value.as_u64_pair();
        self.buf.put_u64(high);
        self.buf.put_u64(low);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reads message attributes from a frame payload.
///
/// Every read is bounds-checked; running past the end of the payload is a
/// corrupt message, never a panic.
pub struct AttributeReader {
    buf: Bytes,
}

impl AttributeReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::corrupt(format!(
                "truncated message: need {} bytes, {} left",
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(ProtocolError::corrupt(format!("negative length: {}", len)));
        }
        Ok(len as usize)
    }

    pub fn read_byte(&mut self) -> Result<i8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        self.ensure(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::corrupt(format!(
                "invalid boolean byte: {:#04x}",
                other
            ))),
        }
    }

    pub fn read_int(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_long(&mut self) -> Result<i64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_int_array(&mut self) -> Result<Vec<i32>, ProtocolError> {
        let len = self.read_len()?;
        self.ensure(len.saturating_mul(4))?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.buf.get_i32());
        }
        Ok(values)
    }

    pub fn read_byte_array(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_len()?;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::corrupt("invalid UTF-8 in string attribute"))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        self.ensure(16)?;
        let high = self.buf.get_u64();
        let low = self.buf.get_u64();
        Ok(Uuid::from_u64_pair(high, low))
    }

    /// Fails if any bytes are left after the last attribute.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::corrupt(format!(
                "{} trailing bytes after message",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_for(f: impl FnOnce(&mut AttributeWriter<'_>)) -> AttributeReader {
        let mut buf = BytesMut::new();
        f(&mut AttributeWriter::new(&mut buf));
        AttributeReader::new(buf.freeze())
    }

    #[test]
    fn test_primitives() {
        let mut reader = reader_for(|w| {
            w.write_byte(-5);
            w.write_bool(true);
            w.write_int(i32::MIN);
            w.write_long(-1);
            w.write_int_array(&[1, 2, 3]);
            w.write_byte_array(b"");
            w.write_string("h\u{e9}llo");
        });

        assert_eq!(reader.read_byte().unwrap(), -5);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_int().unwrap(), i32::MIN);
        assert_eq!(reader.read_long().unwrap(), -1);
        assert_eq!(reader.read_int_array().unwrap(), vec![1, 2, 3]);
        assert!(reader.read_byte_array().unwrap().is_empty());
        assert_eq!(reader.read_string().unwrap(), "h\u{e9}llo");
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = BytesMut::new();
        let mut writer = AttributeWriter::new(&mut buf);
        writer.write_int(1);
        writer.write_string("ab");
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_uuid() {
        let id = Uuid::new_v4();
        let mut reader = reader_for(|w| w.write_uuid(&id));
        assert_eq!(reader.read_uuid().unwrap(), id);
    }

    #[test]
    fn test_truncated() {
        let mut reader = AttributeReader::new(Bytes::from_static(&[0, 0, 0, 9, 1, 2]));
        assert!(matches!(
            reader.read_byte_array(),
            Err(ProtocolError::CorruptMessage { .. })
        ));

        let mut reader = AttributeReader::new(Bytes::from_static(&[0, 0]));
        assert!(reader.read_long().is_err());
    }

    #[test]
    fn test_negative_length() {
        let mut reader = AttributeReader::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]));
        let err = reader.read_int_array().unwrap_err();
        assert!(err.to_string().contains("negative length"));
    }

    #[test]
    fn test_invalid_bool() {
        let mut reader = AttributeReader::new(Bytes::from_static(&[2]));
        assert!(reader.read_bool().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = reader_for(|w| w.write_byte_array(&[0xC3, 0x28]));
        assert!(reader.read_string().is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let reader = AttributeReader::new(Bytes::from_static(&[1]));
        assert!(reader.finish().is_err());
    }
}
