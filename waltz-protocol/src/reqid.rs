//! Request identifier attached to every data-plane message.

use crate::error::ProtocolError;
use crate::wire::{AttributeReader, AttributeWriter};
use std::fmt;

/// Encoded size of a [`ReqId`] in bytes.
pub const REQ_ID_SIZE: usize = 16;

/// Correlation key of a data-plane message: origin client, target partition
/// and the issuing connection's sequence number.
///
/// A sequence number is never reused on a connection while a call carrying
/// it is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId {
    client_id: i32,
    partition_id: i32,
    seq_num: i64,
}

impl ReqId {
    pub fn new(client_id: i32, partition_id: i32, seq_num: i64) -> Self {
        Self {
            client_id,
            partition_id,
            seq_num,
        }
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn seq_num(&self) -> i64 {
        self.seq_num
    }

    pub fn write_to(&self, writer: &mut AttributeWriter<'_>) {
        writer.write_int(self.client_id);
        writer.write_int(self.partition_id);
        writer.write_long(self.seq_num);
    }

    pub fn read_from(reader: &mut AttributeReader) -> Result<Self, ProtocolError> {
        let client_id = reader.read_int()?;
        let partition_id = reader.read_int()?;
        let seq_num = reader.read_long()?;
        Ok(Self::new(client_id, partition_id, seq_num))
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReqId(client={}, partition={}, seq={})",
            self.client_id, self.partition_id, self.seq_num
        )
    }
}
