//! Layered configuration: an optional file, then `CAS__`-prefixed
//! environment variables, then CLI flags (A1).
//!
//! Mirrors the teacher's `config::Config::builder()` + `mod default` idiom
//! almost verbatim; only the schema changed.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use url::Url;

pub fn load_config(config_file_path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("CAS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub batch: BatchConfig,
    pub merkle: MerkleConfig,
    pub chain: ChainConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Batch sizing and request-timeout windows (C2/C8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default::max_stream_limit")]
    pub max_stream_limit: usize,
    #[serde(default = "default::min_stream_limit")]
    pub min_stream_limit: usize,
    #[serde(default = "default::candidate_limit")]
    pub candidate_limit: usize,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::max_anchoring_delay")]
    pub max_anchoring_delay: Duration,
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::processing_timeout")]
    pub processing_timeout: Duration,
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::ready_timeout")]
    pub ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::failure_retry_window")]
    pub failure_retry_window: Duration,
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::alert_on_long_anchor")]
    pub alert_on_long_anchor: Duration,
}

/// Merkle tree shape (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleConfig {
    /// 0 = unbounded.
    #[serde(default = "default::merkle_depth_limit")]
    pub depth_limit: u32,
}

/// Blockchain submission parameters (C9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: Url,
    pub signing_key: String,
    pub chain_id: u64,

    #[serde(default)]
    pub use_smart_contract_anchors: bool,
    #[serde(default)]
    pub contract_address: Option<Address>,

    #[serde(default = "default::max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::transaction_timeout")]
    pub transaction_timeout: Duration,

    #[serde(default)]
    pub override_gas_config: bool,
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub database_url: String,
    #[serde(default = "default::migrate")]
    pub migrate: bool,
    #[serde(default = "default::max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BlobConfig {
    Memory,
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::scheduler_interval")]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: default::scheduler_interval(),
        }
    }
}

mod default {
    use std::time::Duration;

    pub fn max_stream_limit() -> usize {
        100
    }
    pub fn min_stream_limit() -> usize {
        1
    }
    pub fn candidate_limit() -> usize {
        0
    }
    pub fn max_anchoring_delay() -> Duration {
        Duration::from_secs(10 * 60)
    }
    pub fn processing_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }
    pub fn ready_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }
    pub fn failure_retry_window() -> Duration {
        Duration::from_secs(60 * 60)
    }
    pub fn alert_on_long_anchor() -> Duration {
        Duration::from_secs(60 * 60)
    }
    pub fn merkle_depth_limit() -> u32 {
        0
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn transaction_timeout() -> Duration {
        Duration::from_secs(60)
    }
    pub fn migrate() -> bool {
        true
    }
    pub fn max_connections() -> u32 {
        10
    }
    pub fn scheduler_interval() -> Duration {
        Duration::from_secs(30)
    }
}

/// CLI surface. Every flag also reads its own environment variable (the
/// `env` clap feature), layered on top of the `config`-crate file/env pass
/// for single-value overrides such as picking the config file path itself.
#[derive(Debug, Clone, Parser)]
#[command(name = "cas", about = "Ceramic Anchor Service")]
pub struct Options {
    /// Path to a TOML/YAML configuration file.
    #[clap(long, env = "CAS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `ceramic_anchor_service=debug,info`.
    #[clap(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Emit logs as JSON instead of the default human-readable format.
    #[clap(long, env = "CAS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
