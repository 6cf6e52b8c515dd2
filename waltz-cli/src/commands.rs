//! Command execution.

use crate::config::ClientCliConfig;
use crate::validate::{self, ValidateOptions};
use crate::{Commands, StorageCommands};
use colored::Colorize;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use waltz_client::{ClientError, RpcConnection, StorageAdminClient};
use waltz_protocol::admin::{Record, SessionInfo};
use waltz_protocol::message::{
    CheckStorageConnectivityRequest, FlushRequest, HighWaterMarkRequest, TransactionDataRequest,
    TransactionDataResponse,
};
use waltz_protocol::{Message, MessageCodecV1, ReqId};

/// Executes a command and returns the formatted output.
pub async fn execute(
    config: &ClientCliConfig,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Validate {
            txn_per_client,
            num_clients,
            interval,
            high_watermark,
            num_active_partitions,
            no_lock,
            timeout,
        } => {
            let options = ValidateOptions {
                txn_per_client,
                num_clients,
                avg_interval_ms: interval,
                high_watermark,
                num_active_partitions,
                use_lock: !no_lock,
                timeout: Duration::from_secs(timeout),
            };
            let report = validate::run(options, config.client_config()).await?;
            Ok(format!(
                "{} {} transactions, {} producer and {} consumer callbacks in {:.2?}",
                "Validated".green(),
                report.submitted,
                report.producer_callbacks,
                report.consumer_callbacks,
                report.elapsed
            ))
        }

        Commands::HighWaterMark { partition } => {
            let client = DataClient::connect(config).await?;
            let result = client.high_water_mark(partition).await;
            client.close().await;
            Ok(format!(
                "Partition {} high-water mark: {}",
                partition.to_string().cyan(),
                result?
            ))
        }

        Commands::Flush { partition } => {
            let client = DataClient::connect(config).await?;
            let result = client.flush(partition).await;
            client.close().await;
            Ok(format!(
                "{} partition {} at {}",
                "Flushed".green(),
                partition.to_string().cyan(),
                result?
            ))
        }

        Commands::TransactionData {
            partition,
            transaction_id,
        } => {
            let client = DataClient::connect(config).await?;
            let result = client.transaction_data(partition, transaction_id).await;
            client.close().await;
            let data = result?;
            Ok(format!(
                "{}\n{}",
                format!("Transaction {} ({} bytes)", transaction_id, data.len()).bold(),
                hex::encode(data)
            ))
        }

        Commands::CheckConnectivity => {
            let client = DataClient::connect(config).await?;
            let result = client.check_storage_connectivity().await;
            client.close().await;
            Ok(format_connectivity(&result?))
        }

        Commands::Storage {
            storage,
            key,
            command,
        } => {
            let mut connection = config.connection_config();
            connection.addr = storage;
            let admin = StorageAdminClient::connect(connection, key, config.num_partitions).await?;
            let result = execute_storage(&admin, command).await;
            admin.close().await;
            result
        }
    }
}

async fn execute_storage(
    admin: &StorageAdminClient,
    cmd: StorageCommands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        StorageCommands::Metrics => {
            let metrics = admin.metrics().await?;
            Ok(format_json(&metrics))
        }

        StorageCommands::Records {
            partition,
            from,
            max,
        } => {
            let records = admin.record_list(partition, from, max).await?;
            Ok(format_records(partition, &records))
        }

        StorageCommands::SessionInfo { partition } => {
            let info = admin.last_session_info(partition).await?;
            Ok(format_session_info(partition, &info))
        }

        StorageCommands::Assign {
            partitions,
            unassign,
            delete_storage_files,
        } => {
            let list = format_ids(&partitions);
            admin
                .set_partition_assignment(partitions, !unassign, delete_storage_files)
                .await?;
            let verb = if unassign { "Unassigned" } else { "Assigned" };
            Ok(format!("{} partitions {}", verb.green(), list))
        }

        StorageCommands::Available {
            partitions,
            unavailable,
        } => {
            let list = format_ids(&partitions);
            admin
                .set_partition_available(partitions, !unavailable)
                .await?;
            let state = if unavailable {
                "unavailable".yellow()
            } else {
                "available".green()
            };
            Ok(format!("Partitions {} marked {}", list, state))
        }

        StorageCommands::PartitionStatus => {
            let status = admin.assigned_partition_status().await?;
            Ok(format_partition_status(&status))
        }
    }
}

/// Unmounted data-plane connection for one-shot requests.
struct DataClient {
    client_id: i32,
    conn: RpcConnection<MessageCodecV1>,
}

impl DataClient {
    async fn connect(config: &ClientCliConfig) -> Result<Self, ClientError> {
        let client_id = config
            .client_id
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..i32::MAX));
        let conn = RpcConnection::new(MessageCodecV1, config.connection_config())
            .with_origin(client_id);
        conn.connect().await?;
        Ok(Self { client_id, conn })
    }

    fn req_id(&self, partition_id: i32, seq_num: i64) -> ReqId {
        ReqId::new(self.client_id, partition_id, seq_num)
    }

    async fn high_water_mark(&self, partition_id: i32) -> Result<i64, ClientError> {
        let reply = self
            .conn
            .call(|seq| {
                HighWaterMarkRequest {
                    req_id: self.req_id(partition_id, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::HighWaterMarkResponse(r) => Ok(r.transaction_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn flush(&self, partition_id: i32) -> Result<i64, ClientError> {
        let reply = self
            .conn
            .call(|seq| {
                FlushRequest {
                    req_id: self.req_id(partition_id, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::FlushResponse(r) => Ok(r.transaction_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn transaction_data(
        &self,
        partition_id: i32,
        transaction_id: i64,
    ) -> Result<Vec<u8>, ClientError> {
        let reply = self
            .conn
            .call(|seq| {
                TransactionDataRequest {
                    req_id: self.req_id(partition_id, seq),
                    transaction_id,
                }
                .into()
            })
            .await?;
        match reply {
            Message::TransactionDataResponse(TransactionDataResponse {
                data: Some(data), ..
            }) => Ok(data.to_vec()),
            other => Err(unexpected(&other)),
        }
    }

    async fn check_storage_connectivity(&self) -> Result<HashMap<String, bool>, ClientError> {
        let reply = self
            .conn
            .call(|seq| {
                CheckStorageConnectivityRequest {
                    req_id: self.req_id(0, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::CheckStorageConnectivityResponse(r) => Ok(r.storage_connectivity),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&self) {
        self.conn.close().await;
    }
}

fn unexpected(msg: &Message) -> ClientError {
    ClientError::UnexpectedResponse(msg.message_type().tag())
}

fn format_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn format_ids(ids: &[i32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
        .cyan()
        .to_string()
}

fn format_connectivity(connectivity: &HashMap<String, bool>) -> String {
    if connectivity.is_empty() {
        return "No storage nodes configured".yellow().to_string();
    }

    let mut nodes: Vec<_> = connectivity.iter().collect();
    nodes.sort();
    let mut output = format!("{}\n", "Storage connectivity".bold());
    for (node, connected) in nodes {
        let state = if *connected {
            "connected".green()
        } else {
            "unreachable".red()
        };
        output.push_str(&format!("  {}: {}\n", node, state));
    }
    output.trim_end().to_string()
}

fn format_records(partition: i32, records: &[Record]) -> String {
    if records.is_empty() {
        return format!("No records on partition {}", partition)
            .yellow()
            .to_string();
    }

    let mut output = format!("{}\n", format!("Partition {} records", partition).bold());
    for record in records {
        output.push_str(&format!(
            "  {} {} header={} checksum={:08x} data={}\n",
            format!("#{}", record.transaction_id).cyan(),
            record.req_id,
            record.header,
            record.checksum,
            hex::encode(&record.data)
        ));
    }
    output.trim_end().to_string()
}

fn format_session_info(partition: i32, info: &SessionInfo) -> String {
    format!(
        "{}\n  session id: {}\n  low-water mark: {}\n  local low-water mark: {}",
        format!("Partition {} last session", partition).bold(),
        info.session_id,
        info.low_water_mark,
        info.local_low_water_mark
    )
}

fn format_partition_status(status: &[(i32, bool)]) -> String {
    if status.is_empty() {
        return "No partitions assigned".yellow().to_string();
    }

    let mut status = status.to_vec();
    status.sort();
    let mut output = format!("{}\n", "Assigned partitions".bold());
    for (partition, writable) in status {
        let state = if writable {
            "writable".green()
        } else {
            "read-only".yellow()
        };
        output.push_str(&format!("  {}: {}\n", partition.to_string().cyan(), state));
    }
    output.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use uuid::Uuid;
    use waltz_protocol::checksum;
    use waltz_protocol::message::AppendRequest;
    use waltz_server::{Server, ServerConfig};

    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::default()
                .with_num_partitions(2)
                .with_storage_nodes(vec!["storage-0:55280".to_string()]),
        ));
        let running = server.clone();
        tokio::spawn(async move { running.run_with_listener(listener).await });
        (server, addr)
    }

    fn config(addr: SocketAddr) -> ClientCliConfig {
        ClientCliConfig {
            server: addr,
            num_partitions: 2,
            ..Default::default()
        }
    }

    fn append(server: &Server, partition_id: i32, data: &[u8]) {
        let request = AppendRequest {
            req_id: ReqId::new(9, partition_id, 1),
            client_high_water_mark: -1,
            write_locks: vec![],
            read_locks: vec![],
            append_locks: vec![],
            header: 0,
            data: data.to_vec().into(),
            checksum: checksum::compute(data),
        };
        server.partitions().get(partition_id).unwrap().append(&request);
    }

    #[tokio::test]
    async fn test_one_shot_commands() {
        let (server, addr) = start_server().await;
        append(&server, 1, b"\x01\x02");
        append(&server, 1, b"\xff");
        let config = config(addr);

        let output = execute(&config, Commands::HighWaterMark { partition: 1 })
            .await
            .unwrap();
        assert!(output.ends_with(": 1"), "{}", output);

        let output = execute(&config, Commands::Flush { partition: 0 })
            .await
            .unwrap();
        assert!(output.ends_with("-1"), "{}", output);

        let output = execute(
            &config,
            Commands::TransactionData {
                partition: 1,
                transaction_id: 0,
            },
        )
        .await
        .unwrap();
        assert!(output.ends_with("0102"), "{}", output);

        let output = execute(&config, Commands::CheckConnectivity).await.unwrap();
        assert!(output.contains("storage-0:55280"), "{}", output);
    }

    #[tokio::test]
    async fn test_missing_transaction_fails() {
        let (_server, addr) = start_server().await;
        let result = execute(
            &config(addr),
            Commands::TransactionData {
                partition: 0,
                transaction_id: 3,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_storage_command_against_data_port_fails() {
        let (_server, addr) = start_server().await;
        let result = execute(
            &config(addr),
            Commands::Storage {
                storage: addr,
                key: Uuid::new_v4(),
                command: StorageCommands::Metrics,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_format_records() {
        let records = vec![Record {
            transaction_id: 7,
            req_id: ReqId::new(1, 0, 3),
            header: 2,
            data: vec![0xab, 0xcd].into(),
            checksum: 0x1f,
        }];
        let output = format_records(0, &records);
        assert!(output.contains("header=2 checksum=0000001f data=abcd"));
        assert!(format_records(0, &[]).contains("No records"));
    }

    #[test]
    fn test_format_partition_status() {
        let output = format_partition_status(&[(3, false), (1, true)]);
        let first = output.find("writable").unwrap();
        let second = output.find("read-only").unwrap();
        assert!(first < second);
        assert!(format_partition_status(&[]).contains("No partitions"));
    }
}
