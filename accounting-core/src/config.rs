//! Configuration for the accounting engine

use crate::types::{AllocationPriority, ProductCategory};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Accounting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// HTTP listen address
    pub listen_addr: String,

    /// Address other instances use to reach this one
    pub advertised_address: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Processor configuration
    pub processor: ProcessorConfig,

    /// Leader election configuration
    pub election: ElectionConfig,

    /// Forwarding configuration
    pub forwarding: ForwardingConfig,

    /// Product categories accepted for charging
    pub categories: Vec<ProductCategory>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/accounting"),
            service_name: "accounting-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            advertised_address: "127.0.0.1:8080".to_string(),
            rocksdb: RocksDBConfig::default(),
            processor: ProcessorConfig::default(),
            election: ElectionConfig::default(),
            forwarding: ForwardingConfig::default(),
            categories: Vec::new(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Bounded mailbox size (backpressure)
    pub mailbox_capacity: usize,

    /// Order in which a wallet's allocations are charged
    pub allocation_priority: AllocationPriority,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            allocation_priority: AllocationPriority::EarliestExpiring,
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Lease lifetime (milliseconds)
    pub lease_ttl_ms: u64,

    /// Lease renewal interval (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Fixed leader address, if leadership is assigned by deployment.
    ///
    /// The server binary only knows fixed leases. Leases that move between
    /// instances are injected as a `LeaderLease` through `Collaborators`.
    pub static_leader: Option<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 15_000,
            heartbeat_interval_ms: 5_000,
            static_leader: None,
        }
    }
}

impl ElectionConfig {
    /// Lease lifetime
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Renewal interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Request timeout towards the leader (milliseconds)
    pub timeout_ms: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ACCOUNTING_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("ACCOUNTING_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(addr) = std::env::var("ACCOUNTING_ADVERTISED_ADDRESS") {
            config.advertised_address = addr;
        }

        if let Ok(leader) = std::env::var("ACCOUNTING_LEADER") {
            config.election.static_leader = Some(leader);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.processor.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "processor.mailbox_capacity must be positive".to_string(),
            ));
        }
        if self.election.heartbeat_interval_ms == 0
            || self.election.heartbeat_interval_ms >= self.election.lease_ttl_ms
        {
            return Err(crate::Error::Config(
                "election.heartbeat_interval_ms must be positive and below lease_ttl_ms"
                    .to_string(),
            ));
        }
        if self.advertised_address.is_empty() {
            return Err(crate::Error::Config(
                "advertised_address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
