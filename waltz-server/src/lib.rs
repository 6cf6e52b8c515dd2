//! # waltz-server
//!
//! In-memory Waltz server.
//!
//! This crate provides:
//! - TCP connection handling with the hello handshake
//! - Partitioned, totally ordered transaction logs kept in memory
//! - Append acceptance under the lock table and high-water-mark contract
//! - Feeds streaming committed transactions to mounted clients
//! - YAML and environment based configuration

pub mod config;
pub mod error;
pub mod partition;
pub mod server;
pub mod session;

pub use config::{ClusterConfig, Config, ConfigError, NetworkConfig};
pub use error::ServerError;
pub use partition::{AppendOutcome, Partition, PartitionSet, StoredRecord};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
