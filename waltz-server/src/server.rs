//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::partition::PartitionSet;
use crate::session::{Session, SessionState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use waltz_protocol::message::Message;
use waltz_protocol::{Decoder, Encoder, HelloResponse, MessageCodecV1, DEFAULT_PORT};

/// Capacity of the channel carrying feed messages to a connection.
const FEED_CHANNEL_CAPACITY: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Sessions without a live feed are closed after this long without traffic.
    pub idle_timeout: Duration,
    /// Maximum time a single outbound write may take.
    pub liveness_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    pub num_partitions: i32,
    pub feed_batch_size: usize,
    pub storage_nodes: Vec<String>,
    pub unavailable_partitions: Vec<i32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            liveness_timeout: Duration::from_secs(60),
            max_connections: 1000,
            num_partitions: 1,
            feed_batch_size: 1000,
            storage_nodes: Vec::new(),
            unavailable_partitions: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_num_partitions(mut self, num_partitions: i32) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    pub fn with_feed_batch_size(mut self, feed_batch_size: usize) -> Self {
        self.feed_batch_size = feed_batch_size.max(1);
        self
    }

    pub fn with_storage_nodes(mut self, storage_nodes: Vec<String>) -> Self {
        self.storage_nodes = storage_nodes;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            liveness_timeout: config.network.liveness_timeout(),
            max_connections: config.network.max_connections,
            num_partitions: config.cluster.num_partitions,
            feed_batch_size: config.cluster.feed_batch_size,
            storage_nodes: config.cluster.storage_nodes.clone(),
            unavailable_partitions: config.cluster.unavailable_partitions.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for Waltz.
pub struct Server {
    config: Arc<ServerConfig>,
    partitions: Arc<PartitionSet>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let partitions = PartitionSet::new(config.num_partitions);
        for id in &config.unavailable_partitions {
            if let Some(partition) = partitions.get(*id) {
                partition.set_available(false);
            }
        }
        Self {
            config: Arc::new(config),
            partitions: Arc::new(partitions),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} partitions)",
            listener.local_addr()?,
            self.partitions.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let partitions = self.partitions.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    partitions,
                                    config,
                                    stats.clone(),
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection: hello, then requests and feed traffic.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        partitions: Arc<PartitionSet>,
        config: Arc<ServerConfig>,
        stats: Arc<ServerStats>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);
        stream.set_nodelay(true)?;

        let (feed_tx, mut feed_rx) = mpsc::channel::<Message>(FEED_CHANNEL_CAPACITY);
        let mut session = Session::new(addr, partitions, &config, feed_tx);
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                biased;

                Some(msg) = feed_rx.recv() => {
                    Self::write_message(&mut stream, &msg, config.liveness_timeout).await?;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            session.touch();
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => {
                    if !session.has_live_feeds() && session.idle_duration() >= config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            if session.state() == SessionState::Connected {
                let hello = match decoder.decode_hello() {
                    Ok(Some(hello)) => hello,
                    Ok(None) => continue,
                    Err(e) => {
                        let response = HelloResponse::Rejected {
                            reason: e.to_string(),
                        };
                        let _ = stream
                            .write_all(&Encoder::encode_hello_response(&response)?)
                            .await;
                        return Err(e.into());
                    }
                };
                let response = session.handle_hello(&hello);
                stream
                    .write_all(&Encoder::encode_hello_response(&response)?)
                    .await?;
                if let HelloResponse::Rejected { reason } = response {
                    return Err(ServerError::Handshake(reason));
                }
            }

            loop {
                let msg = match decoder.decode_message(&MessageCodecV1) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => {
                        tracing::warn!("[{}] Unrecoverable protocol error: {}", addr, e);
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::warn!("[{}] Dropping unreadable frame: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                match session.handle(msg) {
                    Ok(Some(reply)) => {
                        Self::write_message(&mut stream, &reply, config.liveness_timeout).await?
                    }
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::warn!("[{}] Closing session: {}", addr, e);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!("[{}] {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn write_message(
        stream: &mut TcpStream,
        msg: &Message,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        let frame = Encoder::encode_message(&MessageCodecV1, msg)?;
        tokio::time::timeout(timeout, stream.write_all(&frame))
            .await
            .map_err(|_| ServerError::WriteTimeout)??;
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn partitions(&self) -> &Arc<PartitionSet> {
        &self.partitions
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
