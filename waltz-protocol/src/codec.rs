//! Versioned message codecs and the streaming encoder/decoder built on them.

use crate::admin::{AdminMessage, AdminMessageType, Record, SessionInfo};
use crate::checksum;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader};
use crate::handshake::{Hello, HelloResponse};
use crate::message::*;
use crate::reqid::ReqId;
use crate::wire::{AttributeReader, AttributeWriter};
use crate::{ADMIN_MAGIC, ADMIN_VERSION, HANDSHAKE_MAGIC, HANDSHAKE_VERSION};
use crate::{MESSAGE_MAGIC, MESSAGE_VERSION};
use bytes::{Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

/// Maps one message set to and from frame payloads.
///
/// A codec is identified on the wire by its magic byte and version; a frame
/// carrying any other pair is rejected before its payload is looked at.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: fmt::Debug + Send + 'static;

    fn magic(&self) -> u8;

    fn version(&self) -> u16;

    /// Writes `msg` as a frame payload.
    fn encode_payload(
        &self,
        msg: &Self::Message,
        writer: &mut AttributeWriter<'_>,
    ) -> Result<(), ProtocolError>;

    /// Parses a complete frame payload.
    fn decode_payload(&self, payload: Bytes) -> Result<Self::Message, ProtocolError>;

    /// Encodes `msg` into a complete frame.
    ///
    /// Nothing is returned unless the whole message encoded successfully.
    fn encode(&self, msg: &Self::Message) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        self.encode_payload(msg, &mut AttributeWriter::new(&mut payload))?;
        Frame::new(self.magic(), self.version(), payload.freeze()).encode()
    }
}

/// Data-plane codec, version 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodecV1;

impl MessageCodecV1 {
    fn read_body(
        message_type: MessageType,
        req_id: ReqId,
        reader: &mut AttributeReader,
    ) -> Result<Message, ProtocolError> {
        let msg = match message_type {
            MessageType::MountRequest => MountRequest {
                req_id,
                client_high_water_mark: reader.read_long()?,
                seq_num: reader.read_long()?,
            }
            .into(),
            MessageType::MountResponse => MountResponse {
                req_id,
                partition_ready: reader.read_bool()?,
            }
            .into(),
            MessageType::AppendRequest => {
                let client_high_water_mark = reader.read_long()?;
                let write_locks = reader.read_int_array()?;
                let read_locks = reader.read_int_array()?;
                let header = reader.read_int()?;
                let data = reader.read_byte_array()?;
                let checksum = reader.read_int()?;
                checksum::verify(message_type.tag(), &data, checksum)?;
                AppendRequest {
                    req_id,
                    client_high_water_mark,
                    write_locks,
                    read_locks,
                    append_locks: Vec::new(),
                    header,
                    data,
                    checksum,
                }
                .into()
            }
            MessageType::FeedRequest => FeedRequest {
                req_id,
                client_high_water_mark: reader.read_long()?,
            }
            .into(),
            MessageType::FeedData => FeedData {
                req_id,
                transaction_id: reader.read_long()?,
                header: reader.read_int()?,
            }
            .into(),
            MessageType::FeedSuspended => FeedSuspended { req_id }.into(),
            MessageType::TransactionDataRequest => TransactionDataRequest {
                req_id,
                transaction_id: reader.read_long()?,
            }
            .into(),
            MessageType::TransactionDataResponse => {
                let transaction_id = reader.read_long()?;
                if reader.read_bool()? {
                    let data = reader.read_byte_array()?;
                    let checksum = reader.read_int()?;
                    checksum::verify(message_type.tag(), &data, checksum)?;
                    TransactionDataResponse::success(req_id, transaction_id, data, checksum).into()
                } else {
                    let message = reader.read_string()?;
                    TransactionDataResponse::failure(req_id, transaction_id, message).into()
                }
            }
            MessageType::FlushRequest => FlushRequest { req_id }.into(),
            MessageType::FlushResponse => FlushResponse {
                req_id,
                transaction_id: reader.read_long()?,
            }
            .into(),
            MessageType::LockFailure => LockFailure {
                req_id,
                transaction_id: reader.read_long()?,
            }
            .into(),
            MessageType::HighWaterMarkRequest => HighWaterMarkRequest { req_id }.into(),
            MessageType::HighWaterMarkResponse => HighWaterMarkResponse {
                req_id,
                transaction_id: reader.read_long()?,
            }
            .into(),
            MessageType::CheckStorageConnectivityRequest => {
                CheckStorageConnectivityRequest { req_id }.into()
            }
            MessageType::CheckStorageConnectivityResponse => {
                let count = reader.read_int()?;
                if count < 0 {
                    return Err(ProtocolError::corrupt(format!("negative length: {}", count)));
                }
                let mut storage_connectivity = HashMap::new();
                for _ in 0..count {
                    let node = reader.read_string()?;
                    let connected = reader.read_bool()?;
                    match storage_connectivity.entry(node) {
                        Entry::Occupied(entry) => {
                            return Err(ProtocolError::corrupt(format!(
                                "duplicate storage node: {}",
                                entry.key()
                            )));
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(connected);
                        }
                    }
                }
                CheckStorageConnectivityResponse {
                    req_id,
                    storage_connectivity,
                }
                .into()
            }
        };
        Ok(msg)
    }
}

impl MessageCodec for MessageCodecV1 {
    type Message = Message;

    fn magic(&self) -> u8 {
        MESSAGE_MAGIC
    }

    fn version(&self) -> u16 {
        MESSAGE_VERSION
    }

    fn encode_payload(
        &self,
        msg: &Message,
        writer: &mut AttributeWriter<'_>,
    ) -> Result<(), ProtocolError> {
        let tag = msg.message_type().tag();

        if let Message::AppendRequest(m) = msg {
            if !m.append_locks.is_empty() {
                return Err(ProtocolError::UnsupportedOperation(
                    "append locks not supported, upgrade servers".to_string(),
                ));
            }
        }

        writer.write_byte(tag);
        msg.req_id().write_to(writer);

        match msg {
            Message::MountRequest(m) => {
                writer.write_long(m.client_high_water_mark);
                writer.write_long(m.seq_num);
            }
            Message::MountResponse(m) => writer.write_bool(m.partition_ready),
            Message::AppendRequest(m) => {
                writer.write_long(m.client_high_water_mark);
                writer.write_int_array(&m.write_locks);
                writer.write_int_array(&m.read_locks);
                writer.write_int(m.header);
                writer.write_byte_array(&m.data);
                writer.write_int(m.checksum);
            }
            Message::FeedRequest(m) => writer.write_long(m.client_high_water_mark),
            Message::FeedData(m) => {
                writer.write_long(m.transaction_id);
                writer.write_int(m.header);
            }
            Message::TransactionDataRequest(m) => writer.write_long(m.transaction_id),
            Message::TransactionDataResponse(m) => {
                writer.write_long(m.transaction_id);
                match (&m.data, &m.failure) {
                    (Some(data), None) => {
                        writer.write_bool(true);
                        writer.write_byte_array(data);
                        writer.write_int(m.checksum);
                    }
                    (None, Some(message)) => {
                        writer.write_bool(false);
                        writer.write_string(message);
                    }
                    _ => {
                        return Err(ProtocolError::corrupt(
                            "corrupted message: transaction data response needs exactly one of data or failure",
                        )
                        .with_message_type(tag)
                        .with_seq_num(m.req_id.seq_num()));
                    }
                }
            }
            Message::FlushResponse(m) => writer.write_long(m.transaction_id),
            Message::LockFailure(m) => writer.write_long(m.transaction_id),
            Message::HighWaterMarkResponse(m) => writer.write_long(m.transaction_id),
            Message::CheckStorageConnectivityResponse(m) => {
                let mut nodes: Vec<_> = m.storage_connectivity.iter().collect();
                nodes.sort();
                writer.write_int(nodes.len() as i32);
                for (node, connected) in nodes {
                    writer.write_string(node);
                    writer.write_bool(*connected);
                }
            }
            Message::FeedSuspended(_)
            | Message::FlushRequest(_)
            | Message::HighWaterMarkRequest(_)
            | Message::CheckStorageConnectivityRequest(_) => {}
        }
        Ok(())
    }

    fn decode_payload(&self, payload: Bytes) -> Result<Message, ProtocolError> {
        let mut reader = AttributeReader::new(payload);
        let tag = reader.read_byte()?;
        let message_type = MessageType::try_from(tag)?;
        let req_id = ReqId::read_from(&mut reader).map_err(|e| e.with_message_type(tag))?;

        Self::read_body(message_type, req_id, &mut reader)
            .and_then(|msg| reader.finish().map(|_| msg))
            .map_err(|e| e.with_message_type(tag).with_seq_num(req_id.seq_num()))
    }
}

/// Admin-plane codec, version 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminMessageCodecV0;

impl AdminMessageCodecV0 {
    fn read_body(
        message_type: AdminMessageType,
        seq_num: i64,
        reader: &mut AttributeReader,
    ) -> Result<AdminMessage, ProtocolError> {
        let msg = match message_type {
            AdminMessageType::OpenRequest => AdminMessage::OpenRequest {
                seq_num,
                key: reader.read_uuid()?,
                num_partitions: reader.read_int()?,
            },
            AdminMessageType::SuccessResponse => AdminMessage::SuccessResponse { seq_num },
            AdminMessageType::FailureResponse => AdminMessage::FailureResponse {
                seq_num,
                message: reader.read_string()?,
            },
            AdminMessageType::PartitionAvailableRequest => {
                AdminMessage::PartitionAvailableRequest {
                    seq_num,
                    partition_ids: reader.read_int_array()?,
                    available: reader.read_bool()?,
                }
            }
            AdminMessageType::PartitionAssignmentRequest => {
                AdminMessage::PartitionAssignmentRequest {
                    seq_num,
                    partition_ids: reader.read_int_array()?,
                    assigned: reader.read_bool()?,
                    delete_storage_files: reader.read_bool()?,
                }
            }
            AdminMessageType::MetricsRequest => AdminMessage::MetricsRequest { seq_num },
            AdminMessageType::MetricsResponse => AdminMessage::MetricsResponse {
                seq_num,
                metrics_json: reader.read_string()?,
            },
            AdminMessageType::RecordListRequest => AdminMessage::RecordListRequest {
                seq_num,
                partition_id: reader.read_int()?,
                transaction_id: reader.read_long()?,
                max_num_records: reader.read_int()?,
            },
            AdminMessageType::RecordListResponse => {
                let count = reader.read_int()?;
                if count < 0 {
                    return Err(ProtocolError::corrupt(format!("negative length: {}", count)));
                }
                let mut records = Vec::new();
                for _ in 0..count {
                    let transaction_id = reader.read_long()?;
                    let req_id = ReqId::read_from(reader)?;
                    let header = reader.read_int()?;
                    let data = reader.read_byte_array()?;
                    let checksum = reader.read_int()?;
                    checksum::verify(message_type.tag(), &data, checksum)?;
                    records.push(Record {
                        transaction_id,
                        req_id,
                        header,
                        data,
                        checksum,
                    });
                }
                AdminMessage::RecordListResponse { seq_num, records }
            }
            AdminMessageType::LastSessionInfoRequest => AdminMessage::LastSessionInfoRequest {
                seq_num,
                partition_id: reader.read_int()?,
            },
            AdminMessageType::LastSessionInfoResponse => AdminMessage::LastSessionInfoResponse {
                seq_num,
                session_info: SessionInfo {
                    session_id: reader.read_long()?,
                    low_water_mark: reader.read_long()?,
                    local_low_water_mark: reader.read_long()?,
                },
            },
            AdminMessageType::AssignedPartitionStatusRequest => {
                AdminMessage::AssignedPartitionStatusRequest { seq_num }
            }
            AdminMessageType::AssignedPartitionStatusResponse => {
                let count = reader.read_int()?;
                if count < 0 {
                    return Err(ProtocolError::corrupt(format!("negative length: {}", count)));
                }
                let mut partition_status = Vec::new();
                for _ in 0..count {
                    partition_status.push((reader.read_int()?, reader.read_bool()?));
                }
                AdminMessage::AssignedPartitionStatusResponse {
                    seq_num,
                    partition_status,
                }
            }
        };
        Ok(msg)
    }
}

impl MessageCodec for AdminMessageCodecV0 {
    type Message = AdminMessage;

    fn magic(&self) -> u8 {
        ADMIN_MAGIC
    }

    fn version(&self) -> u16 {
        ADMIN_VERSION
    }

    fn encode_payload(
        &self,
        msg: &AdminMessage,
        writer: &mut AttributeWriter<'_>,
    ) -> Result<(), ProtocolError> {
        writer.write_byte(msg.message_type().tag());
        writer.write_long(msg.seq_num());

        match msg {
            AdminMessage::OpenRequest {
                key,
                num_partitions,
                ..
            } => {
                writer.write_uuid(key);
                writer.write_int(*num_partitions);
            }
            AdminMessage::FailureResponse { message, .. } => writer.write_string(message),
            AdminMessage::PartitionAvailableRequest {
                partition_ids,
                available,
                ..
            } => {
                writer.write_int_array(partition_ids);
                writer.write_bool(*available);
            }
            AdminMessage::PartitionAssignmentRequest {
                partition_ids,
                assigned,
                delete_storage_files,
                ..
            } => {
                writer.write_int_array(partition_ids);
                writer.write_bool(*assigned);
                writer.write_bool(*delete_storage_files);
            }
            AdminMessage::MetricsResponse { metrics_json, .. } => writer.write_string(metrics_json),
            AdminMessage::RecordListRequest {
                partition_id,
                transaction_id,
                max_num_records,
                ..
            } => {
                writer.write_int(*partition_id);
                writer.write_long(*transaction_id);
                writer.write_int(*max_num_records);
            }
            AdminMessage::RecordListResponse { records, .. } => {
                writer.write_int(records.len() as i32);
                for record in records {
                    writer.write_long(record.transaction_id);
                    record.req_id.write_to(writer);
                    writer.write_int(record.header);
                    writer.write_byte_array(&record.data);
                    writer.write_int(record.checksum);
                }
            }
            AdminMessage::LastSessionInfoRequest { partition_id, .. } => {
                writer.write_int(*partition_id)
            }
            AdminMessage::LastSessionInfoResponse { session_info, .. } => {
                writer.write_long(session_info.session_id);
                writer.write_long(session_info.low_water_mark);
                writer.write_long(session_info.local_low_water_mark);
            }
            AdminMessage::AssignedPartitionStatusResponse {
                partition_status, ..
            } => {
                writer.write_int(partition_status.len() as i32);
                for (partition_id, writable) in partition_status {
                    writer.write_int(*partition_id);
                    writer.write_bool(*writable);
                }
            }
            AdminMessage::SuccessResponse { .. }
            | AdminMessage::MetricsRequest { .. }
            | AdminMessage::AssignedPartitionStatusRequest { .. } => {}
        }
        Ok(())
    }

    fn decode_payload(&self, payload: Bytes) -> Result<AdminMessage, ProtocolError> {
        let mut reader = AttributeReader::new(payload);
        let tag = reader.read_byte()?;
        let message_type = AdminMessageType::try_from(tag)?;
        let seq_num = reader.read_long().map_err(|e| e.with_message_type(tag))?;

        Self::read_body(message_type, seq_num, &mut reader)
            .and_then(|msg| reader.finish().map(|_| msg))
            .map_err(|e| e.with_message_type(tag).with_seq_num(seq_num))
    }
}

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a plane message with the given codec.
    pub fn encode_message<C: MessageCodec>(
        codec: &C,
        msg: &C::Message,
    ) -> Result<BytesMut, ProtocolError> {
        codec.encode(msg)
    }

    pub fn encode_hello(hello: &Hello) -> Result<BytesMut, ProtocolError> {
        hello.encode()
    }

    pub fn encode_hello_response(response: &HelloResponse) -> Result<BytesMut, ProtocolError> {
        response.encode()
    }
}

/// Decodes frames and messages from a byte stream.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame, which must carry `magic` and `version`.
    pub fn decode_frame(
        &mut self,
        magic: u8,
        version: u16,
    ) -> Result<Option<Frame>, ProtocolError> {
        if let Some(header) = FrameHeader::peek(&self.buffer) {
            if header.magic != magic || header.version != version {
                return Err(ProtocolError::UnsupportedProtocol {
                    magic: header.magic,
                    version: header.version,
                });
            }
        }
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next plane message.
    pub fn decode_message<C: MessageCodec>(
        &mut self,
        codec: &C,
    ) -> Result<Option<C::Message>, ProtocolError> {
        match self.decode_frame(codec.magic(), codec.version())? {
            Some(frame) => codec.decode_payload(frame.payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn decode_hello(&mut self) -> Result<Option<Hello>, ProtocolError> {
        match self.decode_frame(HANDSHAKE_MAGIC, HANDSHAKE_VERSION)? {
            Some(frame) => Hello::decode(frame.payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn decode_hello_response(&mut self) -> Result<Option<HelloResponse>, ProtocolError> {
        match self.decode_frame(HANDSHAKE_MAGIC, HANDSHAKE_VERSION)? {
            Some(frame) => HelloResponse::decode(frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
