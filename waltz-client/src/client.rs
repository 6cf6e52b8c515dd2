//! Data-plane client.
//!
//! A [`WaltzClient`] mounts every partition, keeps a feed of committed
//! transactions flowing to the application in transaction-id order, and
//! submits new transactions under optimistic locking.

use crate::connection::{ConnectionConfig, ConnectionState, RpcConnection};
use crate::error::ClientError;
use crate::stream::connect_stream;
use crate::transaction::{Transaction, TransactionBuilder, TransactionContext};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use waltz_protocol::message::*;
use waltz_protocol::{MessageCodecV1, ReqId};

/// Default number of times a submit is retried after a lock failure.
pub const DEFAULT_MAX_SUBMIT_RETRIES: u32 = 32;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct WaltzClientConfig {
    pub connection: ConnectionConfig,
    pub num_partitions: i32,
    /// Fixed client id. A random one is picked when unset.
    pub client_id: Option<i32>,
    pub max_submit_retries: u32,
    pub mount_retry_interval: Duration,
    pub max_mount_retries: u32,
}

impl WaltzClientConfig {
    pub fn new(connection: ConnectionConfig, num_partitions: i32) -> Self {
        Self {
            connection,
            num_partitions,
            client_id: None,
            max_submit_retries: DEFAULT_MAX_SUBMIT_RETRIES,
            mount_retry_interval: Duration::from_millis(100),
            max_mount_retries: 50,
        }
    }

    pub fn with_client_id(mut self, client_id: i32) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_max_submit_retries(mut self, retries: u32) -> Self {
        self.max_submit_retries = retries;
        self
    }

    pub fn with_mount_retry(mut self, interval: Duration, max_retries: u32) -> Self {
        self.mount_retry_interval = interval;
        self.max_mount_retries = max_retries;
        self
    }
}

/// Application hooks driven by the client.
pub trait WaltzClientCallbacks: Send + Sync + 'static {
    /// Highest transaction id the application has applied on `partition_id`.
    fn client_high_water_mark(&self, partition_id: i32) -> i64;

    /// Applies the next transaction of a partition. Called in transaction-id order.
    fn apply_transaction(&self, transaction: Transaction) -> Result<(), ClientError>;

    /// Reports a failure while delivering `transaction_id`.
    fn uncaught_exception(&self, partition_id: i32, transaction_id: i64, error: ClientError);
}

struct Partition {
    id: i32,
    high_water_mark: watch::Sender<i64>,
    /// High-water mark at which the feed was last re-requested after a gap.
    refeed_at: AtomicI64,
}

impl Partition {
    fn new(id: i32, high_water_mark: i64) -> Self {
        Self {
            id,
            high_water_mark: watch::Sender::new(high_water_mark),
            refeed_at: AtomicI64::new(i64::MIN),
        }
    }

    fn high_water_mark(&self) -> i64 {
        *self.high_water_mark.borrow()
    }
}

struct Inner {
    client_id: i32,
    config: WaltzClientConfig,
    connection: RpcConnection<MessageCodecV1>,
    partitions: Vec<Partition>,
    callbacks: Arc<dyn WaltzClientCallbacks>,
}

impl Inner {
    fn partition(&self, partition_id: i32) -> Option<&Partition> {
        usize::try_from(partition_id)
            .ok()
            .and_then(|index| self.partitions.get(index))
    }

    fn req_id(&self, partition_id: i32, seq_num: i64) -> ReqId {
        ReqId::new(self.client_id, partition_id, seq_num)
    }

    async fn mount(&self, partition: &Partition) -> Result<(), ClientError> {
        let client_high_water_mark = partition.high_water_mark();
        for _ in 0..=self.config.max_mount_retries {
            let reply = self
                .connection
                .call(|seq| {
                    MountRequest {
                        req_id: self.req_id(partition.id, seq),
                        client_high_water_mark,
                        seq_num: seq,
                    }
                    .into()
                })
                .await?;
            match reply {
                Message::MountResponse(r) if r.partition_ready => {
                    tracing::info!(
                        "Mounted partition {} at high-water mark {}",
                        partition.id,
                        client_high_water_mark
                    );
                    return Ok(());
                }
                Message::MountResponse(_) => {
                    tracing::debug!("Partition {} not ready, retrying mount", partition.id);
                    tokio::time::sleep(self.config.mount_retry_interval).await;
                }
                other => return Err(unexpected(&other)),
            }
        }
        Err(ClientError::Rpc(format!(
            "partition {} not ready",
            partition.id
        )))
    }

    async fn request_feed(&self, partition: &Partition) -> Result<(), ClientError> {
        let client_high_water_mark = partition.high_water_mark();
        self.connection
            .send(|seq| {
                FeedRequest {
                    req_id: self.req_id(partition.id, seq),
                    client_high_water_mark,
                }
                .into()
            })
            .await?;
        tracing::debug!(
            "Requested feed for partition {} from {}",
            partition.id,
            client_high_water_mark
        );
        Ok(())
    }

    async fn fetch_data(&self, partition_id: i32, transaction_id: i64) -> Result<Bytes, ClientError> {
        let reply = self
            .connection
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
            }) => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    async fn on_feed_data(&self, feed: FeedData) {
        let partition_id = feed.req_id.partition_id();
        let partition = match self.partition(partition_id) {
            Some(partition) => partition,
            None => {
                tracing::warn!("Feed data for unknown partition {}", partition_id);
                return;
            }
        };

        let current = partition.high_water_mark();
        if feed.transaction_id <= current {
            return;
        }
        if feed.transaction_id > current + 1 {
            if partition.refeed_at.swap(current, Ordering::SeqCst) != current {
                tracing::debug!(
                    "Gap on partition {}: at {}, received {}",
                    partition_id,
                    current,
                    feed.transaction_id
                );
                if let Err(e) = self.request_feed(partition).await {
                    tracing::warn!("Cannot re-request feed for partition {}: {}", partition_id, e);
                }
            }
            return;
        }

        let data = match self.fetch_data(partition_id, feed.transaction_id).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    "Cannot fetch transaction {} of partition {}: {}",
                    feed.transaction_id,
                    partition_id,
                    e
                );
                self.callbacks
                    .uncaught_exception(partition_id, feed.transaction_id, e);
                return;
            }
        };

        let transaction = Transaction::new(feed.transaction_id, feed.req_id, feed.header, data);
        if let Err(e) = self.callbacks.apply_transaction(transaction) {
            self.callbacks
                .uncaught_exception(partition_id, feed.transaction_id, e);
        }
        partition.high_water_mark.send_replace(feed.transaction_id);
    }

    async fn wait_for(&self, partition: &Partition, transaction_id: i64) -> Result<(), ClientError> {
        let mut rx = partition.high_water_mark.subscribe();
        let caught_up = tokio::time::timeout(
            self.config.connection.liveness_timeout,
            rx.wait_for(|hwm| *hwm >= transaction_id),
        )
        .await;
        match caught_up {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

async fn run_feed(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<Message>) {
    while let Some(event) = events.recv().await {
        match event {
            Message::FeedData(feed) => inner.on_feed_data(feed).await,
            Message::FeedSuspended(suspended) => {
                let partition_id = suspended.req_id.partition_id();
                if let Some(partition) = inner.partition(partition_id) {
                    tracing::debug!("Feed suspended on partition {}", partition_id);
                    if let Err(e) = inner.request_feed(partition).await {
                        tracing::warn!("Cannot resume feed for partition {}: {}", partition_id, e);
                    }
                }
            }
            other => tracing::debug!("Ignoring event {:?}", other.message_type()),
        }
    }
    tracing::debug!("Feed for client {} stopped", inner.client_id);
}

fn unexpected(msg: &Message) -> ClientError {
    ClientError::UnexpectedResponse(msg.message_type().tag())
}

/// Data-plane client.
pub struct WaltzClient {
    inner: Arc<Inner>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl WaltzClient {
    /// Connects to the configured server, mounts every partition and starts the feed.
    pub async fn connect(
        config: WaltzClientConfig,
        callbacks: Arc<dyn WaltzClientCallbacks>,
    ) -> Result<Self, ClientError> {
        let stream = connect_stream(&config.connection).await?;
        Self::connect_with_stream(config, callbacks, stream).await
    }

    /// Like [`WaltzClient::connect`], over an already established stream.
    pub async fn connect_with_stream<S>(
        config: WaltzClientConfig,
        callbacks: Arc<dyn WaltzClientCallbacks>,
        stream: S,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = config
            .client_id
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..i32::MAX));
        let connection =
            RpcConnection::new(MessageCodecV1, config.connection.clone()).with_origin(client_id);
        connection.open(stream).await?;
        let events = connection.take_events().ok_or(ClientError::NotConnected)?;

        let partitions = (0..config.num_partitions)
            .map(|id| Partition::new(id, callbacks.client_high_water_mark(id)))
            .collect();
        let inner = Arc::new(Inner {
            client_id,
            config,
            connection,
            partitions,
            callbacks,
        });

        for partition in &inner.partitions {
            if let Err(e) = inner.mount(partition).await {
                inner.connection.close().await;
                return Err(e);
            }
        }

        let feed_task = tokio::spawn(run_feed(inner.clone(), events));
        for partition in &inner.partitions {
            if let Err(e) = inner.request_feed(partition).await {
                feed_task.abort();
                inner.connection.close().await;
                return Err(e);
            }
        }

        tracing::info!(
            "Client {} connected to {} ({} partitions)",
            client_id,
            inner.config.connection.addr,
            inner.partitions.len()
        );
        Ok(Self {
            inner,
            feed_task: Mutex::new(Some(feed_task)),
        })
    }

    pub fn client_id(&self) -> i32 {
        self.inner.client_id
    }

    pub fn num_partitions(&self) -> i32 {
        self.inner.config.num_partitions
    }

    pub fn is_open(&self) -> bool {
        self.inner.connection.state() == ConnectionState::Open
    }

    /// Highest transaction id this client has applied on `partition_id`.
    pub fn client_high_water_mark(&self, partition_id: i32) -> Option<i64> {
        self.inner
            .partition(partition_id)
            .map(Partition::high_water_mark)
    }

    /// Waits until this client has applied `transaction_id` on `partition_id`.
    pub async fn await_high_water_mark(
        &self,
        partition_id: i32,
        transaction_id: i64,
    ) -> Result<(), ClientError> {
        let partition = self.partition(partition_id)?;
        self.inner.wait_for(partition, transaction_id).await
    }

    fn partition(&self, partition_id: i32) -> Result<&Partition, ClientError> {
        self.inner.partition(partition_id).ok_or_else(|| {
            ClientError::InvalidTransaction(format!("partition {} is not mounted", partition_id))
        })
    }

    /// Submits a transaction.
    ///
    /// Returns `Ok(true)` once the server accepted it and `Ok(false)` if the
    /// context declined. On a lock failure the client waits until it has
    /// applied the conflicting transaction, then executes the context again.
    pub async fn submit(&self, context: &dyn TransactionContext) -> Result<bool, ClientError> {
        let result = self.try_submit(context).await;
        context.on_completion(matches!(result, Ok(true)));
        result
    }

    async fn try_submit(&self, context: &dyn TransactionContext) -> Result<bool, ClientError> {
        let partition_id = context.partition_id(self.num_partitions());
        let partition = self.partition(partition_id)?;
        let client_id = self.inner.client_id;
        let mut retries = 0;

        loop {
            let mut builder = TransactionBuilder::new(partition.high_water_mark());
            if !context.execute(&mut builder)? {
                return Ok(false);
            }
            builder.validate()?;

            let result = self
                .inner
                .connection
                .call(move |seq| {
                    builder
                        .into_request(ReqId::new(client_id, partition_id, seq))
                        .into()
                })
                .await;

            match result {
                Ok(Message::FeedData(feed)) => {
                    tracing::debug!(
                        "Transaction {} committed on partition {}",
                        feed.transaction_id,
                        partition_id
                    );
                    return Ok(true);
                }
                Ok(other) => return Err(unexpected(&other)),
                Err(ClientError::LockFailure { transaction_id, .. })
                    if retries < self.inner.config.max_submit_retries =>
                {
                    retries += 1;
                    tracing::warn!(
                        "Lock failure on partition {} against transaction {}, retry {}",
                        partition_id,
                        transaction_id,
                        retries
                    );
                    self.inner.wait_for(partition, transaction_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Server-side high-water mark of a partition.
    pub async fn high_water_mark(&self, partition_id: i32) -> Result<i64, ClientError> {
        let reply = self
            .inner
            .connection
            .call(|seq| {
                HighWaterMarkRequest {
                    req_id: self.inner.req_id(partition_id, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::HighWaterMarkResponse(r) => Ok(r.transaction_id),
            other => Err(unexpected(&other)),
        }
    }

    /// Waits until everything appended to the partition is durable and
    /// returns the resulting high-water mark.
    pub async fn flush(&self, partition_id: i32) -> Result<i64, ClientError> {
        let reply = self
            .inner
            .connection
            .call(|seq| {
                FlushRequest {
                    req_id: self.inner.req_id(partition_id, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::FlushResponse(r) => Ok(r.transaction_id),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches the data of a committed transaction.
    pub async fn transaction_data(
        &self,
        partition_id: i32,
        transaction_id: i64,
    ) -> Result<Bytes, ClientError> {
        self.inner.fetch_data(partition_id, transaction_id).await
    }

    /// Connectivity from the server to each storage node.
    pub async fn check_storage_connectivity(&self) -> Result<HashMap<String, bool>, ClientError> {
        let reply = self
            .inner
            .connection
            .call(|seq| {
                CheckStorageConnectivityRequest {
                    req_id: self.inner.req_id(0, seq),
                }
                .into()
            })
            .await?;
        match reply {
            Message::CheckStorageConnectivityResponse(r) => Ok(r.storage_connectivity),
            other => Err(unexpected(&other)),
        }
    }

    /// Closes the connection and stops the feed.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        if let Some(task) = self.feed_task.lock().take() {
            task.abort();
        }
        tracing::debug!("Client {} closed", self.inner.client_id);
    }
}

impl Drop for WaltzClient {
    fn drop(&mut self) {
        if let Some(task) = self.feed_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::PartitionLocalLock;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::net::TcpListener;
    use waltz_protocol::ProtocolError;
    use waltz_server::{Server, ServerConfig};

    async fn start_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));
        let running = server.clone();
        tokio::spawn(async move { running.run_with_listener(listener).await });
        (server, addr)
    }

    fn client_config(addr: SocketAddr, num_partitions: i32) -> WaltzClientConfig {
        WaltzClientConfig::new(
            ConnectionConfig::new(addr).with_liveness_timeout(Duration::from_secs(5)),
            num_partitions,
        )
    }

    /// Records applied transactions. `gate` holds back every apply while set.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(i32, i64, Bytes)>>,
        errors: Mutex<Vec<(i32, i64, String)>>,
        gate: AtomicBool,
        waiting: AtomicBool,
    }

    impl WaltzClientCallbacks for Recorder {
        fn client_high_water_mark(&self, _partition_id: i32) -> i64 {
            -1
        }

        fn apply_transaction(&self, transaction: Transaction) -> Result<(), ClientError> {
            while self.gate.load(Ordering::SeqCst) {
                self.waiting.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
            }
            self.applied.lock().push((
                transaction.partition_id(),
                transaction.transaction_id,
                transaction.data().clone(),
            ));
            Ok(())
        }

        fn uncaught_exception(&self, partition_id: i32, transaction_id: i64, error: ClientError) {
            self.errors
                .lock()
                .push((partition_id, transaction_id, error.to_string()));
        }
    }

    /// Writes `hwm + 1` under an optional shared lock.
    struct Counter {
        partition_id: i32,
        lock: Option<PartitionLocalLock>,
        append_lock: Option<PartitionLocalLock>,
        commit: bool,
        executions: AtomicUsize,
        completed: Mutex<Option<bool>>,
    }

    impl Counter {
        fn new(lock: Option<PartitionLocalLock>) -> Self {
            Self {
                partition_id: 0,
                lock,
                append_lock: None,
                commit: true,
                executions: AtomicUsize::new(0),
                completed: Mutex::new(None),
            }
        }
    }

    impl TransactionContext for Counter {
        fn partition_id(&self, _num_partitions: i32) -> i32 {
            self.partition_id
        }

        fn execute(&self, builder: &mut TransactionBuilder) -> Result<bool, ClientError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let value = builder.client_high_water_mark() + 1;
            builder.set_raw_data(value.to_be_bytes().to_vec());
            builder.set_write_locks(self.lock.iter());
            builder.set_append_locks(self.append_lock.iter());
            Ok(self.commit)
        }

        fn on_completion(&self, committed: bool) {
            *self.completed.lock() = Some(committed);
        }
    }

    fn value(data: &Bytes) -> i64 {
        i64::from_be_bytes(data.as_ref().try_into().unwrap())
    }

    #[tokio::test]
    async fn test_submit_feed_and_queries() {
        let config = ServerConfig::default().with_storage_nodes(vec!["storage-1:55280".into()]);
        let (_server, addr) = start_server(config).await;
        let recorder = Arc::new(Recorder::default());
        let client = WaltzClient::connect(client_config(addr, 1).with_client_id(11), recorder.clone())
            .await
            .unwrap();
        assert_eq!(client.client_id(), 11);
        assert!(client.is_open());

        let context = Counter::new(Some(PartitionLocalLock::new("counter", 0)));
        assert!(client.submit(&context).await.unwrap());
        assert_eq!(*context.completed.lock(), Some(true));

        client.await_high_water_mark(0, 0).await.unwrap();
        assert_eq!(client.client_high_water_mark(0), Some(0));
        {
            let applied = recorder.applied.lock();
            assert_eq!(applied.len(), 1);
            assert_eq!((applied[0].0, applied[0].1), (0, 0));
            assert_eq!(value(&applied[0].2), 0);
        }

        assert_eq!(client.high_water_mark(0).await.unwrap(), 0);
        assert_eq!(client.flush(0).await.unwrap(), 0);
        assert_eq!(value(&client.transaction_data(0, 0).await.unwrap()), 0);
        assert!(matches!(
            client.transaction_data(0, 5).await,
            Err(ClientError::Rpc(_))
        ));

        let connectivity = client.check_storage_connectivity().await.unwrap();
        assert_eq!(connectivity.get("storage-1:55280"), Some(&true));

        client.close().await;
        assert!(!client.is_open());
        assert!(matches!(
            client.high_water_mark(0).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_failure_waits_and_retries() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let lock = PartitionLocalLock::new("counter", 0);

        let first = WaltzClient::connect(client_config(addr, 1), Arc::new(Recorder::default()))
            .await
            .unwrap();
        let lagging = Arc::new(Recorder::default());
        lagging.gate.store(true, Ordering::SeqCst);
        let second = WaltzClient::connect(client_config(addr, 1), lagging.clone())
            .await
            .unwrap();

        assert!(first.submit(&Counter::new(Some(lock.clone()))).await.unwrap());

        // The second client has received transaction 0 but not applied it.
        while !lagging.waiting.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let release = lagging.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            release.gate.store(false, Ordering::SeqCst);
        });

        let context = Counter::new(Some(lock));
        assert!(second.submit(&context).await.unwrap());
        assert_eq!(context.executions.load(Ordering::SeqCst), 2);

        second.await_high_water_mark(0, 1).await.unwrap();
        let values: Vec<i64> = lagging.applied.lock().iter().map(|(_, _, d)| value(d)).collect();
        assert_eq!(values, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_context_declines() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = WaltzClient::connect(client_config(addr, 1), Arc::new(Recorder::default()))
            .await
            .unwrap();

        let mut context = Counter::new(None);
        context.commit = false;
        assert!(!client.submit(&context).await.unwrap());
        assert_eq!(*context.completed.lock(), Some(false));
        assert_eq!(client.high_water_mark(0).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_append_locks_rejected_locally() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = WaltzClient::connect(client_config(addr, 1), Arc::new(Recorder::default()))
            .await
            .unwrap();

        let mut context = Counter::new(None);
        context.append_lock = Some(PartitionLocalLock::new("ledger", 1));
        let err = client.submit(&context).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnsupportedOperation(_))
        ));
        assert_eq!(*context.completed.lock(), Some(false));

        // Nothing reached the server and the connection is still usable.
        assert_eq!(client.high_water_mark(0).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = WaltzClient::connect(client_config(addr, 1), Arc::new(Recorder::default()))
            .await
            .unwrap();

        let mut context = Counter::new(None);
        context.partition_id = 3;
        assert!(matches!(
            client.submit(&context).await,
            Err(ClientError::InvalidTransaction(_))
        ));
        assert_eq!(client.client_high_water_mark(3), None);
    }

    #[tokio::test]
    async fn test_mount_gives_up_on_unavailable_partition() {
        let mut config = ServerConfig::default().with_num_partitions(2);
        config.unavailable_partitions = vec![1];
        let (_server, addr) = start_server(config).await;

        let config = client_config(addr, 2).with_mount_retry(Duration::from_millis(5), 2);
        let result = WaltzClient::connect(config, Arc::new(Recorder::default())).await;
        assert!(matches!(result, Err(ClientError::Rpc(ref m)) if m.contains("not ready")));
    }

    #[tokio::test]
    async fn test_failed_feed_request_releases_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use waltz_protocol::{Decoder, HelloResponse, MessageCodec};

        let (stream, mut server) = tokio::io::duplex(64 * 1024);
        // Accepts the hello and the mount, then hangs up before the feed request.
        let peer = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 1024];
            while decoder.decode_hello().unwrap().is_none() {
                let n = server.read(&mut buf).await.unwrap();
                decoder.extend(&buf[..n]);
            }
            let hello = HelloResponse::Accepted { version: 1 }.encode().unwrap();
            server.write_all(&hello).await.unwrap();
            let mount = loop {
                if let Some(msg) = decoder.decode_message(&MessageCodecV1).unwrap() {
                    break msg;
                }
                let n = server.read(&mut buf).await.unwrap();
                decoder.extend(&buf[..n]);
            };
            let reply: Message = MountResponse {
                req_id: mount.req_id(),
                partition_ready: true,
            }
            .into();
            let frame = MessageCodecV1.encode(&reply).unwrap();
            server.write_all(&frame).await.unwrap();
        });

        let recorder = Arc::new(Recorder::default());
        let config = client_config("127.0.0.1:55180".parse().unwrap(), 1);
        let result = WaltzClient::connect_with_stream(config, recorder.clone(), stream).await;
        assert!(result.is_err());
        peer.await.unwrap();

        // The feed task and the connection give back the callbacks.
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&recorder) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client state leaked after failed connect");
    }

    #[tokio::test]
    async fn test_feed_resumes_after_suspension() {
        let (_server, addr) = start_server(ServerConfig::default().with_feed_batch_size(2)).await;
        let writer = WaltzClient::connect(client_config(addr, 1), Arc::new(Recorder::default()))
            .await
            .unwrap();
        for _ in 0..5 {
            assert!(writer.submit(&Counter::new(None)).await.unwrap());
        }

        let recorder = Arc::new(Recorder::default());
        let reader = WaltzClient::connect(client_config(addr, 1), recorder.clone())
            .await
            .unwrap();
        reader.await_high_water_mark(0, 4).await.unwrap();

        let ids: Vec<i64> = recorder.applied.lock().iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(recorder.errors.lock().is_empty());
    }
}
