//! Node configuration — parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub bitcoin: BitcoinSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub security: SecuritySection,
}

/// General node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Directory holding the persisted long-term identity key.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often the settlement/setup confirmation pollers wake up.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Bitcoin network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest".
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self { network: default_network() }
    }
}

/// Default swap pool parameters a locally-created pool falls back on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_min_participants")]
    pub min_participants: usize,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: u64,
    #[serde(default = "default_setup_confirmations")]
    pub setup_confirmations: u32,
    #[serde(default = "default_settlement_confirmations")]
    pub settlement_confirmations: u32,
    #[serde(default = "default_burn_percentage")]
    pub burn_percentage: f64,
    #[serde(default = "default_minimum_burn")]
    pub minimum_burn: u64,
    #[serde(default = "default_maximum_burn")]
    pub maximum_burn: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_participants: default_min_participants(),
            max_participants: default_max_participants(),
            fee_rate: default_fee_rate(),
            setup_confirmations: default_setup_confirmations(),
            settlement_confirmations: default_settlement_confirmations(),
            burn_percentage: default_burn_percentage(),
            minimum_burn: default_minimum_burn(),
            maximum_burn: default_maximum_burn(),
        }
    }
}

/// Security-gate limits (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_duplicate_cache_capacity")]
    pub duplicate_cache_capacity: usize,
    #[serde(default = "default_max_warnings_before_ban")]
    pub max_warnings_before_ban: u32,
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
    #[serde(default = "default_rate_limit_per_window")]
    pub rate_limit_per_window: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_resource_quota_per_window")]
    pub resource_quota_per_window: u32,
    #[serde(default = "default_resource_quota_window_secs")]
    pub resource_quota_window_secs: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            duplicate_cache_capacity: default_duplicate_cache_capacity(),
            max_warnings_before_ban: default_max_warnings_before_ban(),
            ban_duration_secs: default_ban_duration_secs(),
            rate_limit_per_window: default_rate_limit_per_window(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            resource_quota_per_window: default_resource_quota_per_window(),
            resource_quota_window_secs: default_resource_quota_window_secs(),
        }
    }
}

impl SecuritySection {
    pub fn to_gate_config(&self) -> swapsig_security::SecurityConfig {
        swapsig_security::SecurityConfig {
            max_message_size: self.max_message_size,
            duplicate_cache_capacity: self.duplicate_cache_capacity,
            max_warnings_before_ban: self.max_warnings_before_ban,
            ban_duration: Duration::from_secs(self.ban_duration_secs),
            rate_limit_per_window: self.rate_limit_per_window,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            resource_quota_per_window: self.resource_quota_per_window,
            resource_quota_window: Duration::from_secs(self.resource_quota_window_secs),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_secs() -> u64 {
    15
}
fn default_network() -> String {
    "bitcoin".to_string()
}
fn default_min_participants() -> usize {
    3
}
fn default_max_participants() -> usize {
    10
}
fn default_fee_rate() -> u64 {
    1_000
}
fn default_setup_confirmations() -> u32 {
    1
}
fn default_settlement_confirmations() -> u32 {
    1
}
fn default_burn_percentage() -> f64 {
    0.001
}
fn default_minimum_burn() -> u64 {
    500
}
fn default_maximum_burn() -> u64 {
    10_000
}
fn default_max_message_size() -> usize {
    100 * 1024
}
fn default_duplicate_cache_capacity() -> usize {
    10_000
}
fn default_max_warnings_before_ban() -> u32 {
    3
}
fn default_ban_duration_secs() -> u64 {
    300
}
fn default_rate_limit_per_window() -> u32 {
    50
}
fn default_rate_limit_window_secs() -> u64 {
    1
}
fn default_resource_quota_per_window() -> u32 {
    20
}
fn default_resource_quota_window_secs() -> u64 {
    60
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&contents).with_context(|| "failed to parse TOML config")
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `SWAPSIG_DATA_DIR`
    /// - `SWAPSIG_LOG_LEVEL`
    /// - `SWAPSIG_POLL_INTERVAL`
    /// - `SWAPSIG_NETWORK`
    /// - `SWAPSIG_MIN_PARTICIPANTS`
    /// - `SWAPSIG_MAX_PARTICIPANTS`
    /// - `SWAPSIG_FEE_RATE`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SWAPSIG_DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SWAPSIG_LOG_LEVEL") {
            self.node.log_level = v;
        }
        if let Ok(v) = std::env::var("SWAPSIG_POLL_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.node.poll_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SWAPSIG_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("SWAPSIG_MIN_PARTICIPANTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.pool.min_participants = n;
            }
        }
        if let Ok(v) = std::env::var("SWAPSIG_MAX_PARTICIPANTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.pool.max_participants = n;
            }
        }
        if let Ok(v) = std::env::var("SWAPSIG_FEE_RATE") {
            if let Ok(n) = v.parse::<u64>() {
                self.pool.fee_rate = n;
            }
        }
    }

    /// Parse the bitcoin network string to a `bitcoin::Network`.
    pub fn network(&self) -> bitcoin::Network {
        match self.bitcoin.network.as_str() {
            "testnet" | "testnet3" => bitcoin::Network::Testnet,
            "signet" => bitcoin::Network::Signet,
            "regtest" => bitcoin::Network::Regtest,
            _ => bitcoin::Network::Bitcoin,
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.node.data_dir.join("identity.key")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.node.poll_interval_secs)
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.pool.min_participants >= 2,
            "pool.min_participants must be >= 2"
        );
        anyhow::ensure!(
            self.pool.max_participants >= self.pool.min_participants,
            "pool.max_participants must be >= pool.min_participants"
        );
        anyhow::ensure!(
            self.pool.burn_percentage >= 0.0 && self.pool.burn_percentage < 1.0,
            "pool.burn_percentage must be in [0, 1)"
        );
        anyhow::ensure!(
            self.pool.minimum_burn <= self.pool.maximum_burn,
            "pool.minimum_burn must be <= pool.maximum_burn"
        );
        anyhow::ensure!(
            self.node.poll_interval_secs > 0,
            "node.poll_interval_secs must be > 0"
        );
        Ok(())
    }
}
