//! Correlated RPC connections.
//!
//! One [`RpcConnection`] multiplexes any number of concurrent calls over a
//! single ordered byte stream. Every call gets a sequence number; a single
//! reader task matches inbound messages to pending calls by that number.

use crate::error::ClientError;
use crate::stream::connect_stream;
use crate::tls::TlsClientConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use waltz_protocol::admin::AdminMessage;
use waltz_protocol::message::{Message, TransactionDataResponse};
use waltz_protocol::{Decoder, Hello, HelloResponse, MessageCodec, ProtocolError};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// How long to wait for the hello response.
    pub handshake_timeout: Duration,
    /// Read inactivity after which the connection is reported idle.
    pub idle_timeout: Duration,
    /// Read inactivity, with calls outstanding, after which the peer is
    /// considered dead and the connection is torn down.
    pub liveness_timeout: Duration,
    /// Client description sent in the hello.
    pub hello: String,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            hello: "Waltz Client".to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
        }
    }

    pub fn with_hello(mut self, hello: impl Into<String>) -> Self {
        self.hello = hello.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// How the reader task routes an inbound message.
pub trait Correlated: Clone + Send + 'static {
    /// Sequence number of the call this message belongs to.
    fn seq_num(&self) -> i64;

    /// Client and partition of the call, for planes that carry them.
    /// A reply only resolves a call whose route it repeats.
    fn route(&self) -> Option<(i32, i32)>;

    /// Unsolicited messages, forwarded to the event channel.
    fn is_event(&self) -> bool;

    /// Requests acknowledged by an event instead of a response.
    fn acked_by_event(&self) -> bool;

    /// Turns failure replies into the matching error.
    fn into_result(self) -> Result<Self, ClientError>;
}

impl Correlated for Message {
    fn seq_num(&self) -> i64 {
        self.req_id().seq_num()
    }

    fn route(&self) -> Option<(i32, i32)> {
        let req_id = self.req_id();
        Some((req_id.client_id(), req_id.partition_id()))
    }

    fn is_event(&self) -> bool {
        matches!(self, Message::FeedData(_) | Message::FeedSuspended(_))
    }

    fn acked_by_event(&self) -> bool {
        matches!(self, Message::AppendRequest(_))
    }

    fn into_result(self) -> Result<Self, ClientError> {
        match self {
            Message::LockFailure(failure) => Err(ClientError::LockFailure {
                partition_id: failure.req_id.partition_id(),
                transaction_id: failure.transaction_id,
            }),
            Message::TransactionDataResponse(TransactionDataResponse {
                failure: Some(reason),
                ..
            }) => Err(ClientError::Rpc(reason)),
            other => Ok(other),
        }
    }
}

impl Correlated for AdminMessage {
    fn seq_num(&self) -> i64 {
        AdminMessage::seq_num(self)
    }

    fn route(&self) -> Option<(i32, i32)> {
        None
    }

    fn is_event(&self) -> bool {
        false
    }

    fn acked_by_event(&self) -> bool {
        false
    }

    fn into_result(self) -> Result<Self, ClientError> {
        match self {
            AdminMessage::FailureResponse { message, .. } => Err(ClientError::Rpc(message)),
            other => Ok(other),
        }
    }
}

type Reply<M> = oneshot::Sender<Result<M, ClientError>>;

/// An outstanding call.
struct PendingCall<M> {
    route: Option<(i32, i32)>,
    acked_by_event: bool,
    reply: Reply<M>,
}

impl<M> PendingCall<M> {
    fn resolve(self, result: Result<M, ClientError>) {
        let _ = self.reply.send(result);
    }
}
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the connection handle and its reader task.
struct Shared<C: MessageCodec> {
    codec: C,
    config: ConnectionConfig,
    origin: Option<i32>,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: DashMap<i64, PendingCall<C::Message>>,
    events: Mutex<Option<mpsc::UnboundedSender<C::Message>>>,
}

impl<C> Shared<C>
where
    C: MessageCodec,
    C::Message: Correlated,
{
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn dispatch(&self, msg: C::Message) {
        let seq_num = msg.seq_num();
        let route = msg.route();
        let ours = match (self.origin, route) {
            (Some(mine), Some((theirs, _))) => mine == theirs,
            _ => true,
        };

        if msg.is_event() {
            // Only an append is acknowledged by the feed.
            let call = if ours {
                self.pending
                    .remove_if(&seq_num, |_, call| call.acked_by_event && call.route == route)
            } else {
                None
            };
            if let Some((_, call)) = call {
                tracing::debug!("Event acknowledges call seq={}", seq_num);
                call.resolve(msg.clone().into_result());
            }
            if let Some(events) = self.events.lock().as_ref() {
                let _ = events.send(msg);
            }
            return;
        }

        let call = if ours {
            self.pending.remove_if(&seq_num, |_, call| call.route == route)
        } else {
            None
        };
        match call {
            Some((_, call)) => {
                tracing::debug!("Dispatching response seq={}", seq_num);
                call.resolve(msg.into_result());
            }
            None => tracing::warn!("{}: {:?}", ClientError::OrphanResponse { seq_num }, msg),
        }
    }

    /// Fails the call a corrupt frame belongs to, if it can be attributed.
    fn fail_call(&self, err: ProtocolError) {
        let reply = err.seq_num().and_then(|seq_num| self.pending.remove(&seq_num));
        match reply {
            Some((seq_num, call)) => {
                tracing::warn!("Failing call seq={}: {}", seq_num, err);
                call.resolve(Err(ClientError::Protocol(err)));
            }
            None => tracing::warn!("Dropping unreadable frame: {}", err),
        }
    }

    /// Moves the connection to `Closed` and resolves every pending call.
    async fn teardown(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }
        tracing::debug!("Closing connection: {}", reason);

        let seq_nums: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for seq_num in seq_nums {
            if let Some((_, call)) = self.pending.remove(&seq_num) {
                call.resolve(Err(ClientError::ConnectionClosed));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!("Failed {} pending calls", failed);
        }
        self.events.lock().take();

        match self.writer.try_lock() {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    let _ = writer.shutdown().await;
                }
            }
            Err(_) => {
                // A write is in flight. Shut the writer down once it finishes,
                // giving up after the liveness timeout.
                let shared = self.clone();
                tokio::spawn(async move {
                    let limit = shared.config.liveness_timeout;
                    if let Ok(mut guard) = tokio::time::timeout(limit, shared.writer.lock()).await {
                        if let Some(mut writer) = guard.take() {
                            let _ = writer.shutdown().await;
                            tracing::debug!("Writer released after in-flight write");
                        }
                    }
                });
            }
        }

        *self.state.lock() = ConnectionState::Closed;
    }
}

/// A multiplexed connection speaking the message set of codec `C`.
pub struct RpcConnection<C: MessageCodec> {
    shared: Arc<Shared<C>>,
    next_seq: AtomicI64,
    events: Mutex<Option<mpsc::UnboundedReceiver<C::Message>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C> RpcConnection<C>
where
    C: MessageCodec,
    C::Message: Correlated,
{
    /// Creates a connection in the `Disconnected` state.
    pub fn new(codec: C, config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                codec,
                config,
                origin: None,
                state: Mutex::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                events: Mutex::new(Some(events_tx)),
            }),
            next_seq: AtomicI64::new(0),
            events: Mutex::new(Some(events_rx)),
            reader_task: Mutex::new(None),
        }
    }

    /// Only messages issued by `client_id` may resolve calls on this connection.
    pub fn with_origin(mut self, client_id: i32) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.origin = Some(client_id);
        }
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Takes the receiver of unsolicited messages. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<C::Message>> {
        self.events.lock().take()
    }

    /// Connects to the configured address and performs the handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let stream = connect_stream(&self.shared.config).await?;
        self.open(stream).await
    }

    /// Performs the handshake over an established stream and starts the reader.
    pub async fn open<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyOpened);
            }
            *state = ConnectionState::Handshaking;
        }

        let (mut reader, writer) = tokio::io::split(stream);
        *self.shared.writer.lock().await = Some(Box::new(writer));

        let mut decoder = Decoder::new();
        if let Err(e) = self.handshake(&mut reader, &mut decoder).await {
            tracing::warn!("Handshake with {} failed: {}", self.shared.config.addr, e);
            self.shared.teardown("handshake failed").await;
            return Err(e);
        }

        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Handshaking {
                return Err(ClientError::ConnectionClosed);
            }
            *state = ConnectionState::Open;
        }

        let task = tokio::spawn(read_loop(self.shared.clone(), reader, decoder));
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn handshake<R>(&self, reader: &mut R, decoder: &mut Decoder) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let config = &self.shared.config;
        let codec = &self.shared.codec;
        let hello = Hello::new(codec.magic(), vec![codec.version()], config.hello.clone())
            .with_timeouts(
                config.idle_timeout.as_secs() as u32,
                config.liveness_timeout.as_secs() as u32,
            );
        self.shared.write_frame(&hello.encode()?).await?;

        let response = tokio::time::timeout(
            config.handshake_timeout,
            read_hello_response(reader, decoder, config.read_buffer_size),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        match response {
            HelloResponse::Accepted { version } if version == codec.version() => {
                tracing::debug!("Handshake accepted, codec version {}", version);
                Ok(())
            }
            HelloResponse::Accepted { version } => Err(ClientError::HandshakeRejected(format!(
                "server selected unsupported version {}",
                version
            ))),
            HelloResponse::Rejected { reason } => Err(ClientError::HandshakeRejected(reason)),
        }
    }

    /// Sends a request built around the next sequence number and waits for its reply.
    ///
    /// Encoding happens before the call is registered, so a message the codec
    /// refuses fails here without touching the stream. There is no per-call
    /// timeout; a call ends with its reply or with the connection.
    pub async fn call<F>(&self, build: F) -> Result<C::Message, ClientError>
    where
        F: FnOnce(i64) -> C::Message,
    {
        if self.state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }

        let seq_num = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let request = build(seq_num);
        debug_assert_eq!(request.seq_num(), seq_num);
        let frame = self.shared.codec.encode(&request)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(
            seq_num,
            PendingCall {
                route: request.route(),
                acked_by_event: request.acked_by_event(),
                reply: tx,
            },
        );

        // Teardown may have drained the table before the insert.
        if self.state() != ConnectionState::Open && self.shared.pending.remove(&seq_num).is_some()
        {
            return Err(ClientError::ConnectionClosed);
        }

        tracing::debug!("Sending call seq={} ({} bytes)", seq_num, frame.len());
        if let Err(e) = self.shared.write_frame(&frame).await {
            if self.shared.pending.remove(&seq_num).is_some() {
                tracing::warn!("Write failed for call seq={}: {}", seq_num, e);
                self.shared.teardown("write failed").await;
                return Err(e);
            }
        }

        rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Sends a message that expects no reply. Returns its sequence number.
    pub async fn send<F>(&self, build: F) -> Result<i64, ClientError>
    where
        F: FnOnce(i64) -> C::Message,
    {
        if self.state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }

        let seq_num = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = self.shared.codec.encode(&build(seq_num))?;
        if let Err(e) = self.shared.write_frame(&frame).await {
            self.shared.teardown("write failed").await;
            return Err(e);
        }
        Ok(seq_num)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Closes the connection, failing every pending call with `ConnectionClosed`.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.shared.teardown("closed by client").await;
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl<C: MessageCodec> Drop for RpcConnection<C> {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_hello_response<R>(
    reader: &mut R,
    decoder: &mut Decoder,
    buffer_size: usize,
) -> Result<HelloResponse, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        if let Some(response) = decoder.decode_hello_response()? {
            return Ok(response);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

/// Reads frames until the stream ends, routing each message.
async fn read_loop<C, R>(shared: Arc<Shared<C>>, mut reader: R, mut decoder: Decoder)
where
    C: MessageCodec,
    C::Message: Correlated,
    R: AsyncRead + Unpin,
{
    let config = &shared.config;
    let tick = config.idle_timeout.min(config.liveness_timeout);
    let mut buf = vec![0u8; config.read_buffer_size];
    let mut last_read = Instant::now();

    loop {
        loop {
            match decoder.decode_message(&shared.codec) {
                Ok(Some(msg)) => shared.dispatch(msg),
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!("Unrecoverable protocol error from {}: {}", config.addr, e);
                    shared.teardown("protocol error").await;
                    return;
                }
                Err(e) => shared.fail_call(e),
            }
        }

        match tokio::time::timeout(tick, reader.read(&mut buf)).await {
            Err(_) => {
                let silent = last_read.elapsed();
                let outstanding = shared.pending.len();
                if outstanding > 0 && silent >= config.liveness_timeout {
                    tracing::warn!(
                        "No data from {} for {:?} with {} calls outstanding",
                        config.addr,
                        silent,
                        outstanding
                    );
                    shared.teardown("liveness timeout").await;
                    return;
                }
                tracing::debug!("Connection idle for {:?}", silent);
            }
            Ok(Ok(0)) => {
                tracing::debug!("Connection closed by peer");
                shared.teardown("end of stream").await;
                return;
            }
            Ok(Ok(n)) => {
                last_read = Instant::now();
                decoder.extend(&buf[..n]);
            }
            Ok(Err(e)) => {
                tracing::warn!("Read error from {}: {}", config.addr, e);
                shared.teardown("read error").await;
                return;
            }
        }
    }
}
