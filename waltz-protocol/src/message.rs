//! Data-plane message types exchanged between clients and servers.

use crate::error::ProtocolError;
use crate::reqid::ReqId;
use bytes::Bytes;
use std::collections::HashMap;

/// Data-plane message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MessageType {
    MountRequest = 0,
    MountResponse = 1,
    AppendRequest = 2,
    FeedRequest = 3,
    FeedData = 4,
    FeedSuspended = 5,
    TransactionDataRequest = 6,
    TransactionDataResponse = 7,
    FlushRequest = 8,
    FlushResponse = 9,
    LockFailure = 10,
    HighWaterMarkRequest = 11,
    HighWaterMarkResponse = 12,
    CheckStorageConnectivityRequest = 13,
    CheckStorageConnectivityResponse = 14,
}

impl MessageType {
    pub fn tag(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: i8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::MountRequest,
            1 => MessageType::MountResponse,
            2 => MessageType::AppendRequest,
            3 => MessageType::FeedRequest,
            4 => MessageType::FeedData,
            5 => MessageType::FeedSuspended,
            6 => MessageType::TransactionDataRequest,
            7 => MessageType::TransactionDataResponse,
            8 => MessageType::FlushRequest,
            9 => MessageType::FlushResponse,
            10 => MessageType::LockFailure,
            11 => MessageType::HighWaterMarkRequest,
            12 => MessageType::HighWaterMarkResponse,
            13 => MessageType::CheckStorageConnectivityRequest,
            14 => MessageType::CheckStorageConnectivityResponse,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Opens a client's session on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub req_id: ReqId,
    pub client_high_water_mark: i64,
    /// Client sequence number at mount time.
    pub seq_num: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResponse {
    pub req_id: ReqId,
    pub partition_ready: bool,
}

/// Submits a transaction.
///
/// `client_high_water_mark` is the optimistic-concurrency token: the server
/// rejects the append if any declared lock was written by a transaction the
/// client has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub req_id: ReqId,
    pub client_high_water_mark: i64,
    pub write_locks: Vec<i32>,
    pub read_locks: Vec<i32>,
    /// Reserved. Version 1 cannot carry append locks and refuses to encode them.
    pub append_locks: Vec<i32>,
    pub header: i32,
    pub data: Bytes,
    pub checksum: i32,
}

/// Asks the server to stream transactions above the client's high-water mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub req_id: ReqId,
    pub client_high_water_mark: i64,
}

/// One committed transaction. `req_id` is the id of the append that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedData {
    pub req_id: ReqId,
    pub transaction_id: i64,
    pub header: i32,
}

/// The server stopped a feed; the client must send a new feed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSuspended {
    pub req_id: ReqId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDataRequest {
    pub req_id: ReqId,
    pub transaction_id: i64,
}

/// Transaction data or the reason it could not be served.
///
/// Exactly one of `data` and `failure` is set. Use [`TransactionDataResponse::success`]
/// and [`TransactionDataResponse::failure`] to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDataResponse {
    pub req_id: ReqId,
    pub transaction_id: i64,
    pub data: Option<Bytes>,
    pub checksum: i32,
    pub failure: Option<String>,
}

impl TransactionDataResponse {
    pub fn success(req_id: ReqId, transaction_id: i64, data: Bytes, checksum: i32) -> Self {
        Self {
            req_id,
            transaction_id,
            data: Some(data),
            checksum,
            failure: None,
        }
    }

    pub fn failure(req_id: ReqId, transaction_id: i64, message: impl Into<String>) -> Self {
        Self {
            req_id,
            transaction_id,
            data: None,
            checksum: 0,
            failure: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub req_id: ReqId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResponse {
    pub req_id: ReqId,
    pub transaction_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighWaterMarkRequest {
    pub req_id: ReqId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighWaterMarkResponse {
    pub req_id: ReqId,
    pub transaction_id: i64,
}

/// An append was rejected because a declared lock was written by
/// `transaction_id`, which the client had not seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFailure {
    pub req_id: ReqId,
    pub transaction_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStorageConnectivityRequest {
    pub req_id: ReqId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStorageConnectivityResponse {
    pub req_id: ReqId,
    /// Storage node identity to connectivity.
    pub storage_connectivity: HashMap<String, bool>,
}

/// A data-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    MountRequest(MountRequest),
    MountResponse(MountResponse),
    AppendRequest(AppendRequest),
    FeedRequest(FeedRequest),
    FeedData(FeedData),
    FeedSuspended(FeedSuspended),
    TransactionDataRequest(TransactionDataRequest),
    TransactionDataResponse(TransactionDataResponse),
    FlushRequest(FlushRequest),
    FlushResponse(FlushResponse),
    LockFailure(LockFailure),
    HighWaterMarkRequest(HighWaterMarkRequest),
    HighWaterMarkResponse(HighWaterMarkResponse),
    CheckStorageConnectivityRequest(CheckStorageConnectivityRequest),
    CheckStorageConnectivityResponse(CheckStorageConnectivityResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::MountRequest(_) => MessageType::MountRequest,
            Message::MountResponse(_) => MessageType::MountResponse,
            Message::AppendRequest(_) => MessageType::AppendRequest,
            Message::FeedRequest(_) => MessageType::FeedRequest,
            Message::FeedData(_) => MessageType::FeedData,
            Message::FeedSuspended(_) => MessageType::FeedSuspended,
            Message::TransactionDataRequest(_) => MessageType::TransactionDataRequest,
            Message::TransactionDataResponse(_) => MessageType::TransactionDataResponse,
            Message::FlushRequest(_) => MessageType::FlushRequest,
            Message::FlushResponse(_) => MessageType::FlushResponse,
            Message::LockFailure(_) => MessageType::LockFailure,
            Message::HighWaterMarkRequest(_) => MessageType::HighWaterMarkRequest,
            Message::HighWaterMarkResponse(_) => MessageType::HighWaterMarkResponse,
            Message::CheckStorageConnectivityRequest(_) => {
                MessageType::CheckStorageConnectivityRequest
            }
            Message::CheckStorageConnectivityResponse(_) => {
                MessageType::CheckStorageConnectivityResponse
            }
        }
    }

    pub fn req_id(&self) -> ReqId {
        match self {
            Message::MountRequest(m) => m.req_id,
            Message::MountResponse(m) => m.req_id,
            Message::AppendRequest(m) => m.req_id,
            Message::FeedRequest(m) => m.req_id,
            Message::FeedData(m) => m.req_id,
            Message::FeedSuspended(m) => m.req_id,
            Message::TransactionDataRequest(m) => m.req_id,
            Message::TransactionDataResponse(m) => m.req_id,
            Message::FlushRequest(m) => m.req_id,
            Message::FlushResponse(m) => m.req_id,
            Message::LockFailure(m) => m.req_id,
            Message::HighWaterMarkRequest(m) => m.req_id,
            Message::HighWaterMarkResponse(m) => m.req_id,
            Message::CheckStorageConnectivityRequest(m) => m.req_id,
            Message::CheckStorageConnectivityResponse(m) => m.req_id,
        }
    }

    /// Returns whether a server sends this message (as opposed to a client).
    pub fn is_server_message(&self) -> bool {
        matches!(
            self,
            Message::MountResponse(_)
                | Message::FeedData(_)
                | Message::FeedSuspended(_)
                | Message::TransactionDataResponse(_)
                | Message::FlushResponse(_)
                | Message::LockFailure(_)
                | Message::HighWaterMarkResponse(_)
                | Message::CheckStorageConnectivityResponse(_)
        )
    }
}

macro_rules! impl_into_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(msg: $variant) -> Self {
                    Message::$variant(msg)
                }
            }
        )*
    };
}

impl_into_message!(
    MountRequest,
    MountResponse,
    AppendRequest,
    FeedRequest,
    FeedData,
    FeedSuspended,
    TransactionDataRequest,
    TransactionDataResponse,
    FlushRequest,
    FlushResponse,
    LockFailure,
    HighWaterMarkRequest,
    HighWaterMarkResponse,
    CheckStorageConnectivityRequest,
    CheckStorageConnectivityResponse,
);
