//! Confidence-weighted value aggregation
//!
//! Answers "what is the current value of symbol S and with what
//! confidence" by range-scanning the time-series store across the
//! symbol's sources and applying a staleness threshold. Downstream
//! consumers decide from the confidence whether a value is worth
//! submitting.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::AggregatorConfig;
use crate::store::{Matcher, TsStore, NAME_LABEL, SOURCE_LABEL};
use crate::types::{sanitize_metric_name, API_COUNT_SUFFIX, PRICE_SUFFIX, VOLUME_SUFFIX};

#[derive(Debug, Error)]
pub enum AggregateError {
    /// No source has a qualifying sample inside the staleness window.
    /// Callers own the log site for this.
    #[error("insufficient data to aggregate {0}")]
    InsufficientData(String),
}

/// Reducer applied over the qualifying per-source values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Median,
    Mean,
}

impl AggregationMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "median" => Some(AggregationMethod::Median),
            "mean" => Some(AggregationMethod::Mean),
            _ => None,
        }
    }
}

pub struct Aggregator {
    store: Arc<TsStore>,
    threshold: Duration,
    method: AggregationMethod,
}

impl Aggregator {
    /// `tracker_interval` feeds the derived staleness threshold when the
    /// configured one is zero.
    pub fn new(
        cfg: &AggregatorConfig,
        tracker_interval: Duration,
        store: Arc<TsStore>,
    ) -> Result<Self> {
        let Some(method) = AggregationMethod::parse(&cfg.method) else {
            bail!("unknown aggregation method {:?}", cfg.method);
        };
        Ok(Aggregator {
            store,
            threshold: cfg.confidence_threshold(tracker_interval),
            method,
        })
    }

    /// Aggregate price of `symbol` as of `at`, with a confidence score
    /// in `[0.0, 1.0]`.
    pub fn value(&self, symbol: &str, at: DateTime<Utc>) -> Result<(f64, f64), AggregateError> {
        self.aggregate(symbol, PRICE_SUFFIX, at)
    }

    /// Aggregate trading volume of `symbol` as of `at`.
    pub fn volume(&self, symbol: &str, at: DateTime<Utc>) -> Result<(f64, f64), AggregateError> {
        self.aggregate(symbol, VOLUME_SUFFIX, at)
    }

    fn aggregate(
        &self,
        symbol: &str,
        suffix: &str,
        at: DateTime<Utc>,
    ) -> Result<(f64, f64), AggregateError> {
        let at_ms = at.timestamp_millis();
        let metric = sanitize_metric_name(symbol) + suffix;
        let count_metric = sanitize_metric_name(symbol) + API_COUNT_SUFFIX;

        // Total sources come from the recorded source count, so the
        // aggregator needs no access to the catalog itself.
        let count_series = self
            .store
            .querier(0, at_ms)
            .select(&[Matcher::equal(NAME_LABEL, count_metric.as_str())]);
        let total = count_series
            .first()
            .and_then(|series| series.samples.last())
            .map(|(_, value)| *value as usize)
            .unwrap_or(0);
        if total == 0 {
            return Err(AggregateError::InsufficientData(symbol.to_string()));
        }

        // A sample exactly at `at - threshold` still qualifies; strictly
        // older ones are excluded by the window.
        let mint = at_ms - self.threshold.as_millis() as i64;
        let series = self
            .store
            .querier(mint, at_ms)
            .select(&[Matcher::equal(NAME_LABEL, metric.as_str())]);

        let mut qualifying: Vec<(String, f64)> = series
            .iter()
            .filter_map(|series| {
                let source = series.labels.get(SOURCE_LABEL)?.to_string();
                series.samples.last().map(|(_, value)| (source, *value))
            })
            .collect();

        if qualifying.is_empty() {
            return Err(AggregateError::InsufficientData(symbol.to_string()));
        }
        let confidence = (qualifying.len() as f64 / total as f64).min(1.0);

        let value = match self.method {
            AggregationMethod::Median => {
                qualifying.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(Ordering::Equal)
                        // Ties break toward the lexicographically lower source id.
                        .then_with(|| a.0.cmp(&b.0))
                });
                qualifying[(qualifying.len() - 1) / 2].1
            }
            AggregationMethod::Mean => {
                qualifying.iter().map(|(_, value)| value).sum::<f64>() / qualifying.len() as f64
            }
        };

        Ok((value, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Labels;
    use std::path::PathBuf;

    fn temp_store_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "oraclebot_aggregator_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn aggregator_config(threshold_ms: u64, method: &str) -> AggregatorConfig {
        AggregatorConfig {
            confid_intv_threshold_ms: threshold_ms,
            method: method.to_string(),
        }
    }

    fn seed(store: &Arc<TsStore>, symbol: &str, total: usize, samples: &[(&str, i64, f64)]) {
        let now_ms = Utc::now().timestamp_millis();
        let mut appender = store.appender();
        appender.append(
            Labels::from_pairs([(
                NAME_LABEL,
                format!("{}{}", sanitize_metric_name(symbol), API_COUNT_SUFFIX),
            )]),
            now_ms,
            total as f64,
        );
        for (source, ts, value) in samples {
            appender.append(
                Labels::from_pairs([
                    (
                        NAME_LABEL.to_string(),
                        format!("{}{}", sanitize_metric_name(symbol), PRICE_SUFFIX),
                    ),
                    (SOURCE_LABEL.to_string(), source.to_string()),
                ]),
                *ts,
                *value,
            );
        }
        appender.commit().unwrap();
    }

    #[test]
    fn confidence_is_qualifying_over_total() {
        let dir = temp_store_dir("confidence");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        // One source 2s old, one 120s old, threshold 30s.
        seed(
            &store,
            "LINK/USD",
            2,
            &[
                ("api-1", at_ms - 2_000, 14.5),
                ("api-2", at_ms - 120_000, 15.5),
            ],
        );

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();

        let (value, confidence) = aggregator.value("LINK/USD", at).unwrap();
        assert_eq!(value, 14.5);
        assert_eq!(confidence, 0.5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sample_exactly_at_threshold_boundary_qualifies() {
        let dir = temp_store_dir("boundary");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        seed(
            &store,
            "ETH/USD",
            2,
            &[
                ("api-1", at_ms - 30_000, 2000.0),
                ("api-2", at_ms - 30_001, 2001.0),
            ],
        );

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();

        let (value, confidence) = aggregator.value("ETH/USD", at).unwrap();
        assert_eq!(value, 2000.0);
        assert_eq!(confidence, 0.5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn median_over_odd_and_even_counts() {
        let dir = temp_store_dir("median");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        seed(
            &store,
            "BTC/USD",
            3,
            &[
                ("api-1", at_ms - 1_000, 101.0),
                ("api-2", at_ms - 1_000, 99.0),
                ("api-3", at_ms - 1_000, 100.0),
            ],
        );

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();
        let (value, confidence) = aggregator.value("BTC/USD", at).unwrap();
        assert_eq!(value, 100.0);
        assert_eq!(confidence, 1.0);

        // Even count takes the lower middle; equal values tie-break on
        // the lower source id (same result either way here).
        seed(&store, "EVN/USD", 2, &[
            ("api-1", at_ms - 1_000, 10.0),
            ("api-2", at_ms - 1_000, 20.0),
        ]);
        let (value, _) = aggregator.value("EVN/USD", at).unwrap();
        assert_eq!(value, 10.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mean_reducer_averages_qualifying_values() {
        let dir = temp_store_dir("mean");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        seed(
            &store,
            "BTC/USD",
            2,
            &[
                ("api-1", at_ms - 1_000, 100.0),
                ("api-2", at_ms - 1_000, 200.0),
            ],
        );

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "mean"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();
        let (value, _) = aggregator.value("BTC/USD", at).unwrap();
        assert_eq!(value, 150.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_latest_sample_per_source_counts() {
        let dir = temp_store_dir("latest");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        seed(
            &store,
            "BTC/USD",
            1,
            &[
                ("api-1", at_ms - 3_000, 90.0),
                ("api-1", at_ms - 1_000, 110.0),
            ],
        );

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();
        let (value, confidence) = aggregator.value("BTC/USD", at).unwrap();
        assert_eq!(value, 110.0);
        assert_eq!(confidence, 1.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_qualifying_samples_is_insufficient_data() {
        let dir = temp_store_dir("insufficient");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        seed(&store, "BTC/USD", 2, &[("api-1", at_ms - 120_000, 100.0)]);

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();
        assert!(matches!(
            aggregator.value("BTC/USD", at),
            Err(AggregateError::InsufficientData(_))
        ));

        // Unknown symbols have no recorded source count either.
        assert!(matches!(
            aggregator.value("NOPE/USD", at),
            Err(AggregateError::InsufficientData(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn volume_aggregates_the_volume_series() {
        let dir = temp_store_dir("volume");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let at = Utc::now();
        let at_ms = at.timestamp_millis();

        let mut appender = store.appender();
        appender.append(
            Labels::from_pairs([(NAME_LABEL, "BTC_USD_api_count")]),
            at_ms,
            1.0,
        );
        appender.append(
            Labels::from_pairs([(NAME_LABEL, "BTC_USD_volume"), (SOURCE_LABEL, "api-1")]),
            at_ms - 1_000,
            12_345.0,
        );
        appender.commit().unwrap();

        let aggregator = Aggregator::new(
            &aggregator_config(30_000, "median"),
            Duration::from_secs(30),
            Arc::clone(&store),
        )
        .unwrap();
        let (value, confidence) = aggregator.volume("BTC/USD", at).unwrap();
        assert_eq!(value, 12_345.0);
        assert_eq!(confidence, 1.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_method_is_a_construction_error() {
        let dir = temp_store_dir("method");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        assert!(Aggregator::new(
            &aggregator_config(0, "mode"),
            Duration::from_secs(30),
            store
        )
        .is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
