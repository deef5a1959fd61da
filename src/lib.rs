//! OracleBot Library
//!
//! Price-index ingestion and aggregation core for a decentralized
//! oracle miner. A declarative source catalog feeds per-(symbol, source)
//! polling loops that persist samples into a retention-bounded
//! time-series store; a confidence-weighted aggregator serves current
//! values to downstream consumers (submitter, REST/metrics endpoint).

pub mod aggregator;
pub mod config;
pub mod metrics;
pub mod store;
pub mod tracker;
pub mod types;
