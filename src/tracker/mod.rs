//! Index tracker - polling loops feeding the time-series store
//!
//! Spawns one value loop per (symbol, source) pair plus one source-count
//! loop per symbol. Loops are independent: an error in one never stops
//! its peers, and a single shutdown signal fans out to all of them.

pub mod catalog;
pub mod sources;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::metrics;
use crate::store::{Labels, TsStore, NAME_LABEL, SOURCE_LABEL};
use crate::types::{sanitize_metric_name, API_COUNT_SUFFIX, PRICE_SUFFIX, VOLUME_SUFFIX};
use self::sources::{DataSource, EthClient, PricePoint};

/// Cooperative shutdown signal shared by every worker loop. Flip the
/// sending side to `true` to stop all workers.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Startup delay unit between a symbol's value loops. The ordinal-indexed
/// delay spreads first fetches so they do not cluster into rate limits.
const STAGGER_UNIT: Duration = Duration::from_secs(1);

pub struct IndexTracker {
    cfg: TrackerConfig,
    store: Arc<TsStore>,
    data_sources: HashMap<String, Vec<Arc<dyn DataSource>>>,
}

impl IndexTracker {
    /// Build the tracker from the catalog file named in `cfg`. The chain
    /// client is only required when the catalog declares on-chain
    /// sources.
    pub async fn new(
        cfg: TrackerConfig,
        store: Arc<TsStore>,
        client: Option<EthClient>,
    ) -> Result<Self> {
        let data_sources = catalog::create_data_sources(&cfg, client).await?;
        Ok(IndexTracker {
            cfg,
            store,
            data_sources,
        })
    }

    /// Tracked symbols, in no particular order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.data_sources.keys().map(String::as_str)
    }

    /// Number of configured sources for a symbol.
    pub fn source_count(&self, symbol: &str) -> usize {
        self.data_sources.get(symbol).map(Vec::len).unwrap_or(0)
    }

    /// Run every loop until the shutdown signal trips. Returns only
    /// after all spawned workers have exited.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut workers = JoinSet::new();
        for (symbol, data_sources) in &self.data_sources {
            workers.spawn(record_source_count(
                Arc::clone(&self.store),
                symbol.clone(),
                data_sources.len(),
                self.cfg.interval(),
                shutdown.clone(),
            ));

            for (ordinal, source) in data_sources.iter().enumerate() {
                let interval = source.interval().max(self.cfg.interval());
                workers.spawn(record_values(
                    Arc::clone(&self.store),
                    symbol.clone(),
                    Arc::clone(source),
                    interval,
                    stagger_delay(ordinal),
                    shutdown.clone(),
                ));
            }
        }
        info!(symbols = self.data_sources.len(), "index tracker started");
        while workers.join_next().await.is_some() {}
        info!("index tracker shutdown complete");
    }
}

fn stagger_delay(ordinal: usize) -> Duration {
    STAGGER_UNIT * ordinal as u32
}

/// Poll one data source forever, appending a `_price` and `_volume`
/// sample per successful fetch. Failures wait one full tick; the
/// interval itself is the only retry throttle.
async fn record_values(
    store: Arc<TsStore>,
    symbol: String,
    source: Arc<dyn DataSource>,
    interval: Duration,
    stagger: Duration,
    mut shutdown: ShutdownSignal,
) {
    tokio::select! {
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(stagger) => {}
    }

    let price_name = sanitize_metric_name(&symbol) + PRICE_SUFFIX;
    let volume_name = sanitize_metric_name(&symbol) + VOLUME_SUFFIX;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match source.get().await {
            Err(e) => {
                warn!(source = %source.source(), error = %e, "getting values from data source");
                metrics::record_fetch_error(source.source());
            }
            Ok(point) => {
                // Only manual entries expose a source timestamp.
                if point.source_ts.map(|ts| ts < Utc::now()).unwrap_or(false) {
                    warn!(
                        source = %source.source(),
                        ts = ?point.source_ts,
                        "source value timestamp has expired, dropping sample"
                    );
                } else if let Err(e) =
                    append_values(&store, &price_name, &volume_name, source.source(), &point)
                {
                    warn!(source = %source.source(), error = %e, "adding values to the store");
                } else {
                    metrics::record_sample(source.source(), point.price, point.volume);
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
    }
    debug!(source = %source.source(), "value record loop exited");
}

fn append_values(
    store: &Arc<TsStore>,
    price_name: &str,
    volume_name: &str,
    source_id: &str,
    point: &PricePoint,
) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    let mut appender = store.appender();
    appender.append(
        Labels::from_pairs([(NAME_LABEL, price_name), (SOURCE_LABEL, source_id)]),
        now_ms,
        point.price,
    );
    appender.append(
        Labels::from_pairs([(NAME_LABEL, volume_name), (SOURCE_LABEL, source_id)]),
        now_ms,
        point.volume,
    );
    appender.commit()
}

/// Record the number of sources configured for a symbol. Runs on a loop
/// so the aggregator always finds a fresh value near the current time.
async fn record_source_count(
    store: Arc<TsStore>,
    symbol: String,
    count: usize,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let name = sanitize_metric_name(&symbol) + API_COUNT_SUFFIX;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut appender = store.appender();
        appender.append(
            Labels::from_pairs([(NAME_LABEL, name.as_str())]),
            Utc::now().timestamp_millis(),
            count as f64,
        );
        if let Err(e) = appender.commit() {
            warn!(symbol = %symbol, error = %e, "adding source count to the store");
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
    }
    debug!(symbol = %symbol, "source count record loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Matcher;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    fn temp_store_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "oraclebot_tracker_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    /// Data source fed from a script of canned results; repeats the last
    /// entry once the script runs out.
    #[derive(Debug)]
    struct ScriptedSource {
        id: String,
        script: Mutex<VecDeque<std::result::Result<PricePoint, String>>>,
    }

    impl ScriptedSource {
        fn new(
            id: &str,
            script: Vec<std::result::Result<PricePoint, String>>,
        ) -> Arc<Self> {
            Arc::new(ScriptedSource {
                id: id.to_string(),
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn get(&self) -> Result<PricePoint> {
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            next.map_err(|e| anyhow::anyhow!(e))
        }

        fn interval(&self) -> Duration {
            Duration::ZERO
        }

        fn source(&self) -> &str {
            &self.id
        }
    }

    fn fresh_point(price: f64, volume: f64) -> PricePoint {
        PricePoint {
            price,
            volume,
            source_ts: None,
        }
    }

    fn price_samples(store: &Arc<TsStore>, name: &str) -> Vec<(i64, f64)> {
        let now = Utc::now().timestamp_millis();
        store
            .querier(now - 60_000, now + 60_000)
            .select(&[Matcher::equal(NAME_LABEL, name)])
            .into_iter()
            .flat_map(|s| s.samples)
            .collect()
    }

    #[test]
    fn stagger_is_ordinal_indexed_seconds() {
        assert_eq!(stagger_delay(0), Duration::ZERO);
        assert_eq!(stagger_delay(1), Duration::from_secs(1));
        assert_eq!(stagger_delay(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn successful_fetch_appends_price_and_volume() {
        let dir = temp_store_dir("append");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let source = ScriptedSource::new("scripted-append", vec![Ok(fresh_point(42.0, 7.0))]);

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(record_values(
            Arc::clone(&store),
            "ABC/USD".to_string(),
            source,
            Duration::from_millis(500),
            Duration::ZERO,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(price_samples(&store, "ABC_USD_price").len(), 1);
        let volumes = price_samples(&store, "ABC_USD_volume");
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].1, 7.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stale_source_timestamp_drops_sample_without_error() {
        let dir = temp_store_dir("stale");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let stale = PricePoint {
            price: 10.0,
            volume: 0.0,
            source_ts: Some(Utc::now() - ChronoDuration::minutes(5)),
        };
        let source = ScriptedSource::new("scripted-stale", vec![Ok(stale)]);
        let errors_before = metrics::fetch_errors("scripted-stale");

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(record_values(
            Arc::clone(&store),
            "XYZ/USD".to_string(),
            source,
            Duration::from_millis(50),
            Duration::ZERO,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(price_samples(&store, "XYZ_USD_price").is_empty());
        assert_eq!(metrics::fetch_errors("scripted-stale"), errors_before);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fetch_error_increments_counter_and_appends_nothing() {
        let dir = temp_store_dir("errors");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();
        let source = ScriptedSource::new("scripted-errors", vec![Err("boom".to_string())]);
        let errors_before = metrics::fetch_errors("scripted-errors");

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(record_values(
            Arc::clone(&store),
            "ERR/USD".to_string(),
            source,
            Duration::from_millis(500),
            Duration::ZERO,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(price_samples(&store, "ERR_USD_price").is_empty());
        assert_eq!(metrics::fetch_errors("scripted-errors"), errors_before + 1.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn source_count_loop_records_immediately() {
        let dir = temp_store_dir("api_count");
        let store = TsStore::open(&dir, Duration::from_secs(3600)).unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(record_source_count(
            Arc::clone(&store),
            "ETH/USD".to_string(),
            3,
            Duration::from_secs(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        let counts = price_samples(&store, "ETH_USD_api_count");
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].1, 3.0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
