//! # waltz-client
//!
//! Client library for Waltz.
//!
//! This crate provides:
//! - A correlated RPC connection multiplexing many concurrent calls over one stream
//! - The data-plane client: mount, feed, optimistic-locking submits, flush
//! - The admin-plane client used to manage storage nodes
//! - Optional TLS support

pub mod admin;
pub mod client;
pub mod connection;
pub mod error;
pub mod lock;
pub mod stream;
pub mod tls;
pub mod transaction;

pub use admin::StorageAdminClient;
pub use client::{WaltzClient, WaltzClientCallbacks, WaltzClientConfig};
pub use connection::{ConnectionConfig, ConnectionState, Correlated, RpcConnection};
pub use error::ClientError;
pub use lock::PartitionLocalLock;
pub use tls::TlsClientConfig;
pub use transaction::{
    JsonSerializer, Serializer, Transaction, TransactionBuilder, TransactionContext,
};
