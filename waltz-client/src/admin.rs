//! Admin-plane client for storage nodes.

use crate::connection::{ConnectionConfig, RpcConnection};
use crate::error::ClientError;
use crate::stream::connect_stream;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;
use waltz_protocol::admin::{AdminMessage, Record, SessionInfo};
use waltz_protocol::AdminMessageCodecV0;

/// Hello text announced by admin connections.
pub const ADMIN_CLIENT_HELLO: &str = "Waltz Storage Admin Client";

/// Client for the admin plane of a storage node.
///
/// Every request is answered either by its typed response or by
/// `SuccessResponse`/`FailureResponse`; failures surface as [`ClientError::Rpc`].
pub struct StorageAdminClient {
    conn: RpcConnection<AdminMessageCodecV0>,
    key: Uuid,
    num_partitions: i32,
}

impl StorageAdminClient {
    /// Connects to a storage node and opens an admin session.
    pub async fn connect(
        config: ConnectionConfig,
        key: Uuid,
        num_partitions: i32,
    ) -> Result<Self, ClientError> {
        let config = config.with_hello(ADMIN_CLIENT_HELLO);
        let stream = connect_stream(&config).await?;
        Self::connect_with_stream(config, stream, key, num_partitions).await
    }

    /// Like [`StorageAdminClient::connect`], over an already established stream.
    pub async fn connect_with_stream<S>(
        config: ConnectionConfig,
        stream: S,
        key: Uuid,
        num_partitions: i32,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = RpcConnection::new(AdminMessageCodecV0, config);
        conn.open(stream).await?;

        let client = Self {
            conn,
            key,
            num_partitions,
        };
        let opened = client
            .conn
            .call(|seq_num| AdminMessage::OpenRequest {
                seq_num,
                key,
                num_partitions,
            })
            .await;
        match opened {
            Ok(AdminMessage::SuccessResponse { .. }) => {}
            Ok(other) => {
                client.conn.close().await;
                return Err(ClientError::UnexpectedResponse(other.message_type().tag()));
            }
            Err(ClientError::Rpc(reason)) => {
                client.conn.close().await;
                return Err(ClientError::HandshakeRejected(reason));
            }
            Err(e) => {
                client.conn.close().await;
                return Err(e);
            }
        }

        tracing::info!(
            "Opened admin session with {} (key {}, {} partitions)",
            client.conn.config().addr,
            key,
            num_partitions
        );
        Ok(client)
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn num_partitions(&self) -> i32 {
        self.num_partitions
    }

    // =========================================================================
    // Partition management
    // =========================================================================

    /// Marks partitions readable/writable (or not) on the node.
    pub async fn set_partition_available(
        &self,
        partition_ids: Vec<i32>,
        available: bool,
    ) -> Result<(), ClientError> {
        let reply = self
            .conn
            .call(|seq_num| AdminMessage::PartitionAvailableRequest {
                seq_num,
                partition_ids,
                available,
            })
            .await?;
        expect_success(reply)
    }

    /// Assigns partitions to the node, or unassigns them.
    pub async fn set_partition_assignment(
        &self,
        partition_ids: Vec<i32>,
        assigned: bool,
        delete_storage_files: bool,
    ) -> Result<(), ClientError> {
        let reply = self
            .conn
            .call(|seq_num| AdminMessage::PartitionAssignmentRequest {
                seq_num,
                partition_ids,
                assigned,
                delete_storage_files,
            })
            .await?;
        expect_success(reply)
    }

    /// `(partition id, writable)` for each partition assigned to the node.
    pub async fn assigned_partition_status(&self) -> Result<Vec<(i32, bool)>, ClientError> {
        match self
            .conn
            .call(|seq_num| AdminMessage::AssignedPartitionStatusRequest { seq_num })
            .await?
        {
            AdminMessage::AssignedPartitionStatusResponse {
                partition_status, ..
            } => Ok(partition_status),
            other => Err(unexpected(&other)),
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Node metrics as a JSON document.
    pub async fn metrics(&self) -> Result<serde_json::Value, ClientError> {
        match self
            .conn
            .call(|seq_num| AdminMessage::MetricsRequest { seq_num })
            .await?
        {
            AdminMessage::MetricsResponse { metrics_json, .. } => {
                Ok(serde_json::from_str(&metrics_json)?)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Up to `max_num_records` records starting at `transaction_id`.
    pub async fn record_list(
        &self,
        partition_id: i32,
        transaction_id: i64,
        max_num_records: i32,
    ) -> Result<Vec<Record>, ClientError> {
        match self
            .conn
            .call(|seq_num| AdminMessage::RecordListRequest {
                seq_num,
                partition_id,
                transaction_id,
                max_num_records,
            })
            .await?
        {
            AdminMessage::RecordListResponse { records, .. } => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn last_session_info(&self, partition_id: i32) -> Result<SessionInfo, ClientError> {
        match self
            .conn
            .call(|seq_num| AdminMessage::LastSessionInfoRequest {
                seq_num,
                partition_id,
            })
            .await?
        {
            AdminMessage::LastSessionInfoResponse { session_info, .. } => Ok(session_info),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}

fn expect_success(reply: AdminMessage) -> Result<(), ClientError> {
    match reply {
        AdminMessage::SuccessResponse { .. } => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(msg: &AdminMessage) -> ClientError {
    ClientError::UnexpectedResponse(msg.message_type().tag())
}
