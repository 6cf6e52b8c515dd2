//! Admin-plane messages exchanged with storage nodes.
//!
//! Unlike the data plane, admin messages carry a bare sequence number
//! instead of a request identifier.

use crate::error::ProtocolError;
use crate::reqid::ReqId;
use bytes::Bytes;
use uuid::Uuid;

/// Admin-plane message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum AdminMessageType {
    OpenRequest = 0,
    SuccessResponse = 1,
    FailureResponse = 2,
    PartitionAvailableRequest = 3,
    PartitionAssignmentRequest = 4,
    MetricsRequest = 5,
    MetricsResponse = 6,
    RecordListRequest = 7,
    RecordListResponse = 8,
    LastSessionInfoRequest = 9,
    LastSessionInfoResponse = 10,
    AssignedPartitionStatusRequest = 11,
    AssignedPartitionStatusResponse = 12,
}

impl AdminMessageType {
    pub fn tag(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for AdminMessageType {
    type Error = ProtocolError;

    fn try_from(tag: i8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => AdminMessageType::OpenRequest,
            1 => AdminMessageType::SuccessResponse,
            2 => AdminMessageType::FailureResponse,
            3 => AdminMessageType::PartitionAvailableRequest,
            4 => AdminMessageType::PartitionAssignmentRequest,
            5 => AdminMessageType::MetricsRequest,
            6 => AdminMessageType::MetricsResponse,
            7 => AdminMessageType::RecordListRequest,
            8 => AdminMessageType::RecordListResponse,
            9 => AdminMessageType::LastSessionInfoRequest,
            10 => AdminMessageType::LastSessionInfoResponse,
            11 => AdminMessageType::AssignedPartitionStatusRequest,
            12 => AdminMessageType::AssignedPartitionStatusResponse,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// A stored transaction as listed by a storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub transaction_id: i64,
    pub req_id: ReqId,
    pub header: i32,
    pub data: Bytes,
    pub checksum: i32,
}

/// Session bookkeeping a storage node keeps for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: i64,
    pub low_water_mark: i64,
    pub local_low_water_mark: i64,
}

/// An admin-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    /// Opens an admin session. `key` identifies the cluster.
    OpenRequest {
        seq_num: i64,
        key: Uuid,
        num_partitions: i32,
    },
    SuccessResponse {
        seq_num: i64,
    },
    FailureResponse {
        seq_num: i64,
        message: String,
    },
    PartitionAvailableRequest {
        seq_num: i64,
        partition_ids: Vec<i32>,
        available: bool,
    },
    PartitionAssignmentRequest {
        seq_num: i64,
        partition_ids: Vec<i32>,
        assigned: bool,
        delete_storage_files: bool,
    },
    MetricsRequest {
        seq_num: i64,
    },
    /// Metrics as a JSON document.
    MetricsResponse {
        seq_num: i64,
        metrics_json: String,
    },
    RecordListRequest {
        seq_num: i64,
        partition_id: i32,
        transaction_id: i64,
        max_num_records: i32,
    },
    RecordListResponse {
        seq_num: i64,
        records: Vec<Record>,
    },
    LastSessionInfoRequest {
        seq_num: i64,
        partition_id: i32,
    },
    LastSessionInfoResponse {
        seq_num: i64,
        session_info: SessionInfo,
    },
    AssignedPartitionStatusRequest {
        seq_num: i64,
    },
    /// `(partition id, writable)` for every partition assigned to the node.
    AssignedPartitionStatusResponse {
        seq_num: i64,
        partition_status: Vec<(i32, bool)>,
    },
}

impl AdminMessage {
    pub fn message_type(&self) -> AdminMessageType {
        match self {
            AdminMessage::OpenRequest { .. } => AdminMessageType::OpenRequest,
            AdminMessage::SuccessResponse { .. } => AdminMessageType::SuccessResponse,
            AdminMessage::FailureResponse { .. } => AdminMessageType::FailureResponse,
            AdminMessage::PartitionAvailableRequest { .. } => {
                AdminMessageType::PartitionAvailableRequest
            }
            AdminMessage::PartitionAssignmentRequest { .. } => {
                AdminMessageType::PartitionAssignmentRequest
            }
            AdminMessage::MetricsRequest { .. } => AdminMessageType::MetricsRequest,
            AdminMessage::MetricsResponse { .. } => AdminMessageType::MetricsResponse,
            AdminMessage::RecordListRequest { .. } => AdminMessageType::RecordListRequest,
            AdminMessage::RecordListResponse { .. } => AdminMessageType::RecordListResponse,
            AdminMessage::LastSessionInfoRequest { .. } => {
                AdminMessageType::LastSessionInfoRequest
            }
            AdminMessage::LastSessionInfoResponse { .. } => {
                AdminMessageType::LastSessionInfoResponse
            }
            AdminMessage::AssignedPartitionStatusRequest { .. } => {
                AdminMessageType::AssignedPartitionStatusRequest
            }
            AdminMessage::AssignedPartitionStatusResponse { .. } => {
                AdminMessageType::AssignedPartitionStatusResponse
            }
        }
    }

    pub fn seq_num(&self) -> i64 {
        match self {
            AdminMessage::OpenRequest { seq_num, .. }
            | AdminMessage::SuccessResponse { seq_num }
            | AdminMessage::FailureResponse { seq_num, .. }
            | AdminMessage::PartitionAvailableRequest { seq_num, .. }
            | AdminMessage::PartitionAssignmentRequest { seq_num, .. }
            | AdminMessage::MetricsRequest { seq_num }
            | AdminMessage::MetricsResponse { seq_num, .. }
            | AdminMessage::RecordListRequest { seq_num, .. }
            | AdminMessage::RecordListResponse { seq_num, .. }
            | AdminMessage::LastSessionInfoRequest { seq_num, .. }
            | AdminMessage::LastSessionInfoResponse { seq_num, .. }
            | AdminMessage::AssignedPartitionStatusRequest { seq_num }
            | AdminMessage::AssignedPartitionStatusResponse { seq_num, .. } => *seq_num,
        }
    }

    /// Returns whether this message answers a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            AdminMessage::SuccessResponse { .. }
                | AdminMessage::FailureResponse { .. }
                | AdminMessage::MetricsResponse { .. }
                | AdminMessage::RecordListResponse { .. }
                | AdminMessage::LastSessionInfoResponse { .. }
                | AdminMessage::AssignedPartitionStatusResponse { .. }
        )
    }
}
