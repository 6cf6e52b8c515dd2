//! Validation workload.
//!
//! A number of producers submit transactions whose data is the producer's
//! high-water mark + 1, all under one shared write lock. Every producer and
//! a final consumer must then see each partition in transaction-id order,
//! and the consumer checks that the data of every transaction equals its id.
//! Without the lock two producers may append the same value, which the
//! consumer reports as an optimistic locking failure.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use waltz_client::{
    ClientError, PartitionLocalLock, Serializer, Transaction, TransactionBuilder,
    TransactionContext, WaltzClient, WaltzClientCallbacks, WaltzClientConfig,
};

const LOCK_NAME: &str = "validate-lock";
const LOCK_ID: i64 = 0;
const LAMBDA: f64 = 1.0;

/// Workload parameters.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub txn_per_client: usize,
    pub num_clients: usize,
    /// Average pause between a producer's transactions, in milliseconds.
    pub avg_interval_ms: u64,
    /// High-water mark the partitions are at before the run.
    pub high_watermark: i64,
    pub num_active_partitions: i32,
    pub use_lock: bool,
    /// Bound on each waiting phase.
    pub timeout: Duration,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            txn_per_client: 1,
            num_clients: 1,
            avg_interval_ms: 0,
            high_watermark: -1,
            num_active_partitions: 1,
            use_lock: true,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Validation errors.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("transaction validation failed: {0}")]
    Failed(String),
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub submitted: usize,
    pub producer_callbacks: usize,
    pub consumer_callbacks: usize,
    pub elapsed: Duration,
}

// =========================================================================
// Countdown latch
// =========================================================================

/// Async countdown latch that can be aborted.
pub struct CountDownLatch {
    count: AtomicUsize,
    aborted: AtomicBool,
    notify: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            aborted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn count_down(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wakes every waiter with a failure.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits until the count reaches zero. Returns `false` if aborted.
    pub async fn wait(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.aborted.load(Ordering::SeqCst) {
                return false;
            }
            if self.count() == 0 {
                return true;
            }
            notified.await;
        }
    }
}

// =========================================================================
// Callbacks and transaction context
// =========================================================================

/// The high-water mark as an 8-byte big-endian integer.
pub struct HighWaterMarkSerializer;

impl Serializer<i64> for HighWaterMarkSerializer {
    fn serialize(&self, value: &i64) -> Result<Vec<u8>, ClientError> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i64, ClientError> {
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
            ClientError::Callback(format!("expected 8 bytes of data, got {}", bytes.len()))
        })?;
        Ok(i64::from_be_bytes(bytes))
    }
}

/// State shared by every client of a run.
struct ValidationState {
    /// (client id, partition id) -> applied high-water mark.
    high_water_marks: DashMap<(i32, i32), i64>,
    uncaught: Mutex<Vec<String>>,
    producer_callbacks: CountDownLatch,
    consumer_callbacks: CountDownLatch,
}

impl ValidationState {
    fn fail(&self, message: String) {
        tracing::warn!("{}", message.trim_end());
        self.uncaught.lock().push(message);
        self.producer_callbacks.abort();
        self.consumer_callbacks.abort();
    }

    fn high_water_mark(&self, client_id: i32, partition_id: i32) -> i64 {
        self.high_water_marks
            .get(&(client_id, partition_id))
            .map(|hwm| *hwm)
            .unwrap_or(-1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Consumer,
}

struct ValidateCallbacks {
    role: Role,
    client_id: i32,
    state: Arc<ValidationState>,
}

impl WaltzClientCallbacks for ValidateCallbacks {
    fn client_high_water_mark(&self, partition_id: i32) -> i64 {
        self.state.high_water_mark(self.client_id, partition_id)
    }

    fn apply_transaction(&self, transaction: Transaction) -> Result<(), ClientError> {
        let partition_id = transaction.partition_id();
        let mut hwm = self
            .state
            .high_water_marks
            .entry((self.client_id, partition_id))
            .or_insert(-1);

        let expected = *hwm + 1;
        if transaction.transaction_id != expected {
            return Err(ClientError::Callback(format!(
                "expect callback transaction id to be {}, but got {}",
                expected, transaction.transaction_id
            )));
        }
        if self.role == Role::Consumer {
            let value = transaction.transaction_data(&HighWaterMarkSerializer)?;
            if value != transaction.transaction_id {
                return Err(ClientError::Callback(
                    "optimistic locking validation failed".to_string(),
                ));
            }
        }
        *hwm = transaction.transaction_id;
        drop(hwm);

        match self.role {
            Role::Producer => self.state.producer_callbacks.count_down(),
            Role::Consumer => self.state.consumer_callbacks.count_down(),
        }
        Ok(())
    }

    fn uncaught_exception(&self, partition_id: i32, transaction_id: i64, error: ClientError) {
        self.state.fail(format!(
            "UncaughtException[partition:{}, transactionId:{}]: {}\n",
            partition_id, transaction_id, error
        ));
    }
}

/// Writes the submitting client's high-water mark + 1.
struct HighWaterMarkContext {
    partition_id: i32,
    lock: Option<PartitionLocalLock>,
}

impl TransactionContext for HighWaterMarkContext {
    fn partition_id(&self, _num_partitions: i32) -> i32 {
        self.partition_id
    }

    fn execute(&self, builder: &mut TransactionBuilder) -> Result<bool, ClientError> {
        let value = builder.client_high_water_mark() + 1;
        builder.set_transaction_data(&value, &HighWaterMarkSerializer)?;
        builder.set_write_locks(self.lock.iter());
        Ok(true)
    }
}

/// Next pause of a Poisson process with the given average, in milliseconds.
pub fn next_exponential_interval(avg_interval_ms: u64) -> u64 {
    let r: f64 = rand::thread_rng().gen();
    (avg_interval_ms as f64 * ((1.0 - r).ln() / -LAMBDA)) as u64
}

// =========================================================================
// Run
// =========================================================================

fn check_options(options: &ValidateOptions, config: &WaltzClientConfig) -> Result<(), ValidateError> {
    if options.high_watermark < -1 {
        return Err(ValidateError::InvalidOption(
            "high-watermark must be greater or equals to -1".to_string(),
        ));
    }
    if options.num_active_partitions < 1 {
        return Err(ValidateError::InvalidOption(
            "num-active-partitions must be greater or equals to 1".to_string(),
        ));
    }
    if options.num_active_partitions > config.num_partitions {
        return Err(ValidateError::InvalidOption(format!(
            "num-active-partitions {} exceeds the {} configured partitions",
            options.num_active_partitions, config.num_partitions
        )));
    }
    Ok(())
}

async fn await_latch(
    latch: &CountDownLatch,
    timeout: Duration,
    what: &'static str,
) -> Result<(), ValidateError> {
    match tokio::time::timeout(timeout, latch.wait()).await {
        Ok(true) => Ok(()),
        // Aborted; the collected failures are reported by the caller.
        Ok(false) => Ok(()),
        Err(_) => Err(ValidateError::Timeout(what)),
    }
}

/// Picks `count` distinct random client ids.
fn client_ids(count: usize) -> Vec<i32> {
    let mut rng = rand::thread_rng();
    let mut ids = HashSet::with_capacity(count);
    while ids.len() < count {
        ids.insert(rng.gen_range(1..i32::MAX));
    }
    ids.into_iter().collect()
}

/// Runs the workload against the configured cluster.
pub async fn run(
    options: ValidateOptions,
    config: WaltzClientConfig,
) -> Result<ValidationReport, ValidateError> {
    check_options(&options, &config)?;
    let started = Instant::now();

    let submitted = options.txn_per_client * options.num_clients;
    let appended = usize::try_from(options.high_watermark + 1).unwrap_or(0);
    // Every producer sees every transaction.
    let expected_producer_callbacks = (appended + submitted) * options.num_clients;
    let expected_consumer_callbacks = appended + submitted;

    let state = Arc::new(ValidationState {
        high_water_marks: DashMap::new(),
        uncaught: Mutex::new(Vec::new()),
        producer_callbacks: CountDownLatch::new(expected_producer_callbacks),
        consumer_callbacks: CountDownLatch::new(expected_consumer_callbacks),
    });
    let lock = options
        .use_lock
        .then(|| PartitionLocalLock::new(LOCK_NAME, LOCK_ID));

    let mut ids = client_ids(options.num_clients + 1);
    let consumer_id = ids.pop().unwrap_or(0);

    // Producers start firing only once all of them are mounted.
    let mut producers = Vec::with_capacity(options.num_clients);
    for client_id in ids {
        let callbacks = Arc::new(ValidateCallbacks {
            role: Role::Producer,
            client_id,
            state: state.clone(),
        });
        let client =
            WaltzClient::connect(config.clone().with_client_id(client_id), callbacks).await?;
        producers.push(Arc::new(client));
    }
    tracing::info!("{} producers ready", producers.len());

    let mut tasks = Vec::with_capacity(producers.len());
    for producer in &producers {
        let producer = producer.clone();
        let state = state.clone();
        let lock = lock.clone();
        let options = options.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..options.txn_per_client {
                let partition_id = rand::thread_rng().gen_range(0..options.num_active_partitions);
                let context = HighWaterMarkContext {
                    partition_id,
                    lock: lock.clone(),
                };
                if let Err(e) = producer.submit(&context).await {
                    state.fail(format!(
                        "Submit by client {} on partition {} failed: {}\n",
                        producer.client_id(),
                        partition_id,
                        e
                    ));
                    return;
                }
                let pause = next_exponential_interval(options.avg_interval_ms);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }));
    }

    let produced = await_latch(&state.producer_callbacks, options.timeout, "producer callbacks").await;
    for task in tasks {
        task.abort();
    }
    for producer in &producers {
        producer.close().await;
    }
    produced?;

    if state.uncaught.lock().is_empty() {
        let callbacks = Arc::new(ValidateCallbacks {
            role: Role::Consumer,
            client_id: consumer_id,
            state: state.clone(),
        });
        let consumer =
            WaltzClient::connect(config.clone().with_client_id(consumer_id), callbacks).await?;
        let consumed =
            await_latch(&state.consumer_callbacks, options.timeout, "consumer callbacks").await;
        consumer.close().await;
        consumed?;
    }

    let uncaught = state.uncaught.lock();
    if !uncaught.is_empty() {
        return Err(ValidateError::Failed(uncaught.concat()));
    }

    Ok(ValidationReport {
        submitted,
        producer_callbacks: expected_producer_callbacks,
        consumer_callbacks: expected_consumer_callbacks,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use waltz_client::ConnectionConfig;
    use waltz_protocol::ReqId;
    use waltz_server::{Server, ServerConfig};

    fn txn_data(value: i64) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    async fn start_server(num_partitions: i32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::default().with_num_partitions(num_partitions),
        ));
        tokio::spawn(async move { server.run_with_listener(listener).await });
        addr
    }

    fn client_config(addr: SocketAddr, num_partitions: i32) -> WaltzClientConfig {
        WaltzClientConfig::new(
            ConnectionConfig::new(addr).with_liveness_timeout(Duration::from_secs(5)),
            num_partitions,
        )
    }

    fn test_state(producers: usize, consumers: usize) -> Arc<ValidationState> {
        Arc::new(ValidationState {
            high_water_marks: DashMap::new(),
            uncaught: Mutex::new(Vec::new()),
            producer_callbacks: CountDownLatch::new(producers),
            consumer_callbacks: CountDownLatch::new(consumers),
        })
    }

    fn transaction(transaction_id: i64, value: i64) -> Transaction {
        Transaction::new(
            transaction_id,
            ReqId::new(5, 0, transaction_id),
            0,
            txn_data(value).into(),
        )
    }

    #[tokio::test]
    async fn test_latch_counts_down() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        latch.count_down();
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert!(waiter.await.unwrap());
        assert!(CountDownLatch::new(0).wait().await);
    }

    #[tokio::test]
    async fn test_latch_abort() {
        let latch = Arc::new(CountDownLatch::new(5));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.abort();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_exponential_interval() {
        assert_eq!(next_exponential_interval(0), 0);
        let total: u64 = (0..1000).map(|_| next_exponential_interval(10)).sum();
        // Mean 10ms, truncated toward zero.
        assert!(total > 5_000 && total < 15_000, "total {}", total);
    }

    #[test]
    fn test_serializer() {
        let bytes = HighWaterMarkSerializer.serialize(&41).unwrap();
        assert_eq!(bytes, txn_data(41));
        assert_eq!(HighWaterMarkSerializer.deserialize(&bytes).unwrap(), 41);
        assert!(HighWaterMarkSerializer.deserialize(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_callbacks_enforce_order() {
        let state = test_state(10, 10);
        let producer = ValidateCallbacks {
            role: Role::Producer,
            client_id: 1,
            state: state.clone(),
        };

        producer.apply_transaction(transaction(0, 0)).unwrap();
        assert_eq!(producer.client_high_water_mark(0), 0);
        let err = producer.apply_transaction(transaction(2, 2)).unwrap_err();
        assert!(err.to_string().contains("expect callback transaction id to be 1, but got 2"));
        assert_eq!(state.producer_callbacks.count(), 9);
    }

    #[test]
    fn test_consumer_detects_duplicate_value() {
        let state = test_state(10, 10);
        let consumer = ValidateCallbacks {
            role: Role::Consumer,
            client_id: 2,
            state: state.clone(),
        };

        consumer.apply_transaction(transaction(0, 0)).unwrap();
        consumer.apply_transaction(transaction(1, 1)).unwrap();
        // Two producers appended from the same high-water mark.
        let err = consumer.apply_transaction(transaction(2, 1)).unwrap_err();
        assert!(err.to_string().contains("optimistic locking validation failed"));
        assert_eq!(consumer.client_high_water_mark(0), 1);

        consumer.uncaught_exception(0, 2, err);
        assert_eq!(state.uncaught.lock().len(), 1);
        assert!(state.uncaught.lock()[0].starts_with("UncaughtException[partition:0, transactionId:2]"));
    }

    #[test]
    fn test_invalid_options() {
        let config = client_config("127.0.0.1:55180".parse().unwrap(), 2);
        let options = ValidateOptions {
            high_watermark: -2,
            ..Default::default()
        };
        assert!(matches!(
            check_options(&options, &config),
            Err(ValidateError::InvalidOption(_))
        ));

        let options = ValidateOptions {
            num_active_partitions: 3,
            ..Default::default()
        };
        assert!(check_options(&options, &config).is_err());
        assert!(check_options(&ValidateOptions::default(), &config).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_validate_with_lock() {
        let addr = start_server(1).await;
        let options = ValidateOptions {
            txn_per_client: 5,
            num_clients: 3,
            timeout: Duration::from_secs(30),
            ..Default::default()
        };

        let report = run(options, client_config(addr, 1)).await.unwrap();
        assert_eq!(report.submitted, 15);
        assert_eq!(report.producer_callbacks, 45);
        assert_eq!(report.consumer_callbacks, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_validate_without_lock_completes() {
        let addr = start_server(1).await;
        let options = ValidateOptions {
            txn_per_client: 5,
            num_clients: 4,
            use_lock: false,
            timeout: Duration::from_secs(30),
            ..Default::default()
        };

        // Concurrent producers may write the same value; the consumer then
        // reports it rather than hanging.
        let result = tokio::time::timeout(Duration::from_secs(60), run(options, client_config(addr, 1)))
            .await
            .expect("validation run hung");
        match result {
            Ok(report) => {
                assert_eq!(report.submitted, 20);
                assert_eq!(report.consumer_callbacks, 20);
            }
            Err(ValidateError::Failed(message)) => {
                assert!(
                    message.contains("optimistic locking validation failed"),
                    "unexpected failure: {}",
                    message
                );
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_validate_existing_transactions_across_partitions() {
        let addr = start_server(2).await;
        let first = ValidateOptions {
            txn_per_client: 3,
            num_clients: 2,
            num_active_partitions: 2,
            timeout: Duration::from_secs(30),
            ..Default::default()
        };
        run(first, client_config(addr, 2)).await.unwrap();

        // Six transactions are already in the log.
        let second = ValidateOptions {
            txn_per_client: 2,
            num_clients: 2,
            high_watermark: 5,
            num_active_partitions: 2,
            timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let report = run(second, client_config(addr, 2)).await.unwrap();
        assert_eq!(report.consumer_callbacks, 10);
    }
}
