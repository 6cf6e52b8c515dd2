//! waltz-cli - Command-line interface for Waltz
//!
//! Runs the validation workload, one-shot client requests and storage node
//! administration.

mod commands;
mod config;
mod validate;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::ClientCliConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use waltz_client::TlsClientConfig;

#[derive(Parser)]
#[command(name = "waltz-cli")]
#[command(about = "Command-line interface for the Waltz transaction log")]
#[command(version)]
struct Cli {
    /// Client configuration file (YAML)
    #[arg(short, long, env = "WALTZ_CLI_CONFIG")]
    config: Option<PathBuf>,

    /// Server address, overrides the configuration file
    #[arg(short, long, env = "WALTZ_SERVER")]
    server: Option<SocketAddr>,

    /// Number of partitions, overrides the configuration file
    #[arg(short = 'p', long)]
    num_partitions: Option<i32>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "WALTZ_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "WALTZ_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "WALTZ_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "WALTZ_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run producers and a consumer and check every callback arrives in order
    Validate {
        /// Transactions each producer submits
        #[arg(long, default_value = "1")]
        txn_per_client: usize,

        /// Number of producers
        #[arg(long, default_value = "1")]
        num_clients: usize,

        /// Average interval between a producer's transactions, in milliseconds
        #[arg(long, default_value = "0")]
        interval: u64,

        /// Current high-water mark of the cluster
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        high_watermark: i64,

        /// Number of partitions the producers write to
        #[arg(long, default_value = "1")]
        num_active_partitions: i32,

        /// Submit without the shared write lock
        #[arg(long)]
        no_lock: bool,

        /// Seconds to wait for each phase
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Get the high-water mark of a partition
    HighWaterMark {
        #[arg(short, long, default_value = "0")]
        partition: i32,
    },

    /// Flush a partition and print the resulting high-water mark
    Flush {
        #[arg(short, long, default_value = "0")]
        partition: i32,
    },

    /// Print the data of a committed transaction
    TransactionData {
        #[arg(short, long, default_value = "0")]
        partition: i32,

        /// Transaction id
        transaction_id: i64,
    },

    /// Check connectivity from the server to its storage nodes
    CheckConnectivity,

    /// Storage node administration
    Storage {
        /// Storage node admin address
        #[arg(long, env = "WALTZ_STORAGE")]
        storage: SocketAddr,

        /// Cluster key
        #[arg(long, env = "WALTZ_CLUSTER_KEY")]
        key: Uuid,

        #[command(subcommand)]
        command: StorageCommands,
    },
}

#[derive(Subcommand)]
pub enum StorageCommands {
    /// Print the node's metrics
    Metrics,

    /// List stored records of a partition
    Records {
        #[arg(short, long)]
        partition: i32,

        /// First transaction id
        #[arg(short, long, default_value = "0")]
        from: i64,

        /// Maximum records to return
        #[arg(short, long, default_value = "20")]
        max: i32,
    },

    /// Print the last session of a partition
    SessionInfo {
        #[arg(short, long)]
        partition: i32,
    },

    /// Assign partitions to the node
    Assign {
        #[arg(value_delimiter = ',', required = true)]
        partitions: Vec<i32>,

        /// Unassign instead
        #[arg(long)]
        unassign: bool,

        /// Delete storage files when unassigning
        #[arg(long, requires = "unassign")]
        delete_storage_files: bool,
    },

    /// Mark partitions available for reads and writes
    Available {
        #[arg(value_delimiter = ',', required = true)]
        partitions: Vec<i32>,

        /// Mark unavailable instead
        #[arg(long)]
        unavailable: bool,
    },

    /// Print the partitions assigned to the node
    PartitionStatus,
}

fn build_config(cli: &Cli) -> Result<ClientCliConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ClientCliConfig::from_file(path)?,
        None => ClientCliConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(num_partitions) = cli.num_partitions {
        config.num_partitions = num_partitions;
    }

    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let mut tls = TlsClientConfig::new();
        tls.enabled = true;

        if let Some(ref path) = cli.ca_cert {
            tls.ca_cert_path = Some(path.clone());
        }
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => {
                tls.client_cert_path = Some(cert.clone());
                tls.client_key_path = Some(key.clone());
            }
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".into()),
        }
        tls.insecure = cli.insecure;
        tls.server_name = cli.server_name.clone();
        config.tls = tls;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    match commands::execute(&config, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
