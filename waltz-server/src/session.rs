//! Session management and request handling.

use crate::error::ServerError;
use crate::partition::{AppendOutcome, Partition, PartitionSet};
use crate::server::ServerConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use waltz_protocol::message::*;
use waltz_protocol::{Hello, HelloResponse, ReqId, MESSAGE_MAGIC, MESSAGE_VERSION};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for the hello.
    Connected,
    /// Handshake complete, ready for requests.
    Ready,
    /// Hello was rejected; the connection is closing.
    Closing,
}

/// A client session.
pub struct Session {
    /// Unique session ID.
    pub id: Uuid,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    /// Client description from the hello.
    client_name: Option<String>,

    /// Timeouts the client announced in its hello.
    client_timeouts: Option<(Duration, Duration)>,

    partitions: Arc<PartitionSet>,
    feed_batch_size: usize,
    storage_nodes: Vec<String>,

    /// Live feed per partition.
    feeds: HashMap<i32, JoinHandle<()>>,
    feed_tx: mpsc::Sender<Message>,

    request_count: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    /// Creates a new session. Feed messages are delivered to `feed_tx`.
    pub fn new(
        remote_addr: SocketAddr,
        partitions: Arc<PartitionSet>,
        config: &ServerConfig,
        feed_tx: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            state: SessionState::Connected,
            client_name: None,
            client_timeouts: None,
            partitions,
            feed_batch_size: config.feed_batch_size,
            storage_nodes: config.storage_nodes.clone(),
            feeds: HashMap::new(),
            feed_tx,
            request_count: 0,
            created_at: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Idle and liveness timeouts announced by the client.
    pub fn client_timeouts(&self) -> Option<(Duration, Duration)> {
        self.client_timeouts
    }

    /// Negotiates the data-plane codec version.
    pub fn handle_hello(&mut self, hello: &Hello) -> HelloResponse {
        match hello.negotiate(MESSAGE_MAGIC, &[MESSAGE_VERSION]) {
            Some(version) => {
                self.client_name = Some(hello.hello.clone());
                self.client_timeouts = Some((
                    Duration::from_secs(u64::from(hello.idle_timeout_secs)),
                    Duration::from_secs(u64::from(hello.liveness_timeout_secs)),
                ));
                self.state = SessionState::Ready;
                tracing::info!(
                    "[{}] Hello from '{}', codec version {}",
                    self.remote_addr,
                    hello.hello,
                    version
                );
                HelloResponse::Accepted { version }
            }
            None => {
                self.state = SessionState::Closing;
                let reason = format!(
                    "unsupported protocol: magic {:#04x}, versions {:?}",
                    hello.magic, hello.versions
                );
                tracing::warn!("[{}] Rejecting hello: {}", self.remote_addr, reason);
                HelloResponse::Rejected { reason }
            }
        }
    }

    /// Handles one request. Returns the reply to write, if any.
    pub fn handle(&mut self, msg: Message) -> Result<Option<Message>, ServerError> {
        self.record_request();
        tracing::debug!(
            "[{}] Request: {:?} {}",
            self.remote_addr,
            msg.message_type(),
            msg.req_id()
        );

        let reply: Message = match msg {
            Message::MountRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?;
                let ready = partition.is_available();
                tracing::info!(
                    "[{}] Mount partition {} at {} (ready: {})",
                    self.remote_addr,
                    partition.id(),
                    m.client_high_water_mark,
                    ready
                );
                MountResponse {
                    req_id: m.req_id,
                    partition_ready: ready,
                }
                .into()
            }
            Message::AppendRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?;
                match partition.append(&m) {
                    AppendOutcome::Accepted(transaction_id) => {
                        tracing::debug!(
                            "[{}] Accepted transaction {} on partition {}",
                            self.remote_addr,
                            transaction_id,
                            partition.id()
                        );
                        if self.has_live_feed(partition.id()) {
                            // The feed acknowledges it.
                            return Ok(None);
                        }
                        FeedData {
                            req_id: m.req_id,
                            transaction_id,
                            header: m.header,
                        }
                        .into()
                    }
                    AppendOutcome::LockFailure(transaction_id) => {
                        tracing::debug!(
                            "[{}] Lock failure on partition {} against transaction {}",
                            self.remote_addr,
                            partition.id(),
                            transaction_id
                        );
                        LockFailure {
                            req_id: m.req_id,
                            transaction_id,
                        }
                        .into()
                    }
                }
            }
            Message::FeedRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?.clone();
                self.start_feed(partition, m.req_id, m.client_high_water_mark);
                return Ok(None);
            }
            Message::TransactionDataRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?;
                match partition.record(m.transaction_id) {
                    Some(record) => TransactionDataResponse::success(
                        m.req_id,
                        record.transaction_id,
                        record.data,
                        record.checksum,
                    ),
                    None => TransactionDataResponse::failure(
                        m.req_id,
                        m.transaction_id,
                        format!(
                            "transaction {} not found in partition {}",
                            m.transaction_id,
                            partition.id()
                        ),
                    ),
                }
                .into()
            }
            Message::FlushRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?;
                FlushResponse {
                    req_id: m.req_id,
                    transaction_id: partition.high_water_mark(),
                }
                .into()
            }
            Message::HighWaterMarkRequest(m) => {
                let partition = self.partition(m.req_id.partition_id())?;
                HighWaterMarkResponse {
                    req_id: m.req_id,
                    transaction_id: partition.high_water_mark(),
                }
                .into()
            }
            Message::CheckStorageConnectivityRequest(m) => CheckStorageConnectivityResponse {
                req_id: m.req_id,
                storage_connectivity: self
                    .storage_nodes
                    .iter()
                    .map(|node| (node.clone(), true))
                    .collect(),
            }
            .into(),
            other => {
                return Err(ServerError::InvalidRequest(format!(
                    "{:?} is not a request",
                    other.message_type()
                )))
            }
        };
        Ok(Some(reply))
    }

    fn partition(&self, partition_id: i32) -> Result<&Arc<Partition>, ServerError> {
        self.partitions
            .get(partition_id)
            .ok_or(ServerError::UnknownPartition(partition_id))
    }

    /// Replaces the partition's feed with one starting after `client_high_water_mark`.
    fn start_feed(&mut self, partition: Arc<Partition>, req_id: ReqId, client_high_water_mark: i64) {
        tracing::debug!(
            "[{}] Feed partition {} from {}",
            self.remote_addr,
            partition.id(),
            client_high_water_mark
        );
        let task = tokio::spawn(run_feed(
            partition.clone(),
            req_id,
            client_high_water_mark,
            self.feed_batch_size,
            self.feed_tx.clone(),
        ));
        if let Some(previous) = self.feeds.insert(partition.id(), task) {
            previous.abort();
        }
    }

    fn has_live_feed(&self, partition_id: i32) -> bool {
        self.feeds
            .get(&partition_id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Returns whether any feed is still streaming.
    pub fn has_live_feeds(&self) -> bool {
        self.feeds.values().any(|task| !task.is_finished())
    }

    fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    /// Marks inbound traffic.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Stops every feed.
    pub fn close(&mut self) {
        for (_, task) in self.feeds.drain() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Streams records after `after`, then follows the partition.
///
/// A backlog larger than one batch is cut short with `FeedSuspended`; the
/// client resumes with a new feed request.
async fn run_feed(
    partition: Arc<Partition>,
    req_id: ReqId,
    mut after: i64,
    batch_size: usize,
    tx: mpsc::Sender<Message>,
) {
    let mut high_water_mark = partition.subscribe();
    loop {
        let records = partition.records_after(after, batch_size + 1);
        let suspend = records.len() > batch_size;

        for record in records.into_iter().take(batch_size) {
            after = record.transaction_id;
            let feed = FeedData {
                req_id: record.req_id,
                transaction_id: record.transaction_id,
                header: record.header,
            };
            if tx.send(feed.into()).await.is_err() {
                return;
            }
        }

        if suspend {
            tracing::debug!(
                "Feed on partition {} suspended at {}",
                partition.id(),
                after
            );
            let _ = tx.send(FeedSuspended { req_id }.into()).await;
            return;
        }

        if high_water_mark.wait_for(|hwm| *hwm > after).await.is_err() {
            return;
        }
    }
}
