//! Configuration management for OracleBot
//!
//! Loads from optional config files + environment variables via .env

use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub tracker: TrackerConfig,
    pub aggregator: AggregatorConfig,
    pub store: StoreConfig,
    pub ethereum: EthereumConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Default polling period in milliseconds; per-source intervals of
    /// zero inherit this value
    pub interval_ms: u64,
    /// Per-HTTP-request budget in milliseconds
    pub fetch_timeout_ms: u64,
    /// Path to the source catalog
    pub api_file: String,
    /// Path to the manual-data file
    pub manual_data_file: String,
}

impl TrackerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum sample age counted toward confidence, in milliseconds.
    /// Zero derives `tracker.interval + 1s`.
    pub confid_intv_threshold_ms: u64,
    /// Reducer over qualifying samples: "median" or "mean"
    pub method: String,
}

impl AggregatorConfig {
    pub fn confidence_threshold(&self, tracker_interval: Duration) -> Duration {
        if self.confid_intv_threshold_ms == 0 {
            // Values outside the default tracker interval are not used
            // and would only decrease the confidence level.
            tracker_interval + Duration::from_secs(1)
        } else {
            Duration::from_millis(self.confid_intv_threshold_ms)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the sample logs
    pub data_dir: String,
    /// Retention window in hours
    pub retention_hours: u64,
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint; empty disables on-chain sources
    pub node_url: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Tracker defaults
            .set_default("tracker.interval_ms", 60_000)?
            .set_default("tracker.fetch_timeout_ms", 10_000)?
            .set_default("tracker.api_file", "config/index.json")?
            .set_default("tracker.manual_data_file", "config/manual_data.json")?
            // Aggregator defaults
            .set_default("aggregator.confid_intv_threshold_ms", 0)?
            .set_default("aggregator.method", "median")?
            // Store defaults: the aggregator needs data only 24 hours in
            // the past, 48 leaves a safety margin.
            .set_default("store.data_dir", "./data/samples")?
            .set_default("store.retention_hours", 48)?
            // Ethereum defaults
            .set_default("ethereum.node_url", "")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLEBOT_*)
            .add_source(Environment::with_prefix("ORACLEBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if self.tracker.interval_ms == 0 {
            bail!("tracker.interval_ms must be greater than zero");
        }
        if self.tracker.fetch_timeout_ms == 0 {
            bail!("tracker.fetch_timeout_ms must be greater than zero");
        }
        if self.store.retention_hours == 0 {
            bail!("store.retention_hours must be greater than zero");
        }
        if !matches!(self.aggregator.method.as_str(), "median" | "mean") {
            bail!(
                "aggregator.method must be \"median\" or \"mean\", got {:?}",
                self.aggregator.method
            );
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "interval={}ms fetch_timeout={}ms api_file={} retention={}h method={}",
            self.tracker.interval_ms,
            self.tracker.fetch_timeout_ms,
            self.tracker.api_file,
            self.store.retention_hours,
            self.aggregator.method
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
