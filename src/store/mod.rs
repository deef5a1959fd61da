//! Append-only labelled time-series store
//!
//! Holds float samples keyed by a sorted label set, bounded by a
//! retention window. Writers buffer samples in an [`Appender`] and make
//! them visible atomically on commit; readers range-scan through a
//! [`Querier`] with equality matchers. Committed samples are also
//! appended to daily CSV files under the data directory and replayed on
//! open, so a restart keeps whatever the retention window preserves.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reserved label carrying the metric name.
pub const NAME_LABEL: &str = "__name__";
/// Label carrying the canonical data-source id.
pub const SOURCE_LABEL: &str = "source";

const FILE_PREFIX: &str = "samples_";
const FILE_SUFFIX: &str = ".csv";

/// A single name/value label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// A sorted label set identifying one series.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Labels(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Stable identity of the series this label set names.
    fn key(&self) -> String {
        let mut key = String::new();
        for label in &self.0 {
            key.push_str(&label.name);
            key.push('\u{1}');
            key.push_str(&label.value);
            key.push('\u{2}');
        }
        key
    }
}

/// Equality matcher over one label name.
#[derive(Debug, Clone)]
pub struct Matcher {
    name: String,
    value: String,
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher {
            name: name.into(),
            value: value.into(),
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.name) == Some(self.value.as_str())
    }
}

/// One series returned by a query: labels plus ascending samples.
#[derive(Debug, Clone)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<(i64, f64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SampleRow {
    timestamp_ms: i64,
    labels: String,
    value: f64,
}

struct SeriesData {
    labels: Labels,
    samples: VecDeque<(i64, f64)>,
}

struct DailyLog {
    day: NaiveDate,
    writer: csv::Writer<File>,
}

/// Retention-bounded time-series store.
pub struct TsStore {
    data_dir: PathBuf,
    retention: Duration,
    series: RwLock<HashMap<String, SeriesData>>,
    log: Mutex<DailyLog>,
}

impl TsStore {
    /// Open (or create) a store under `data_dir`, replaying any persisted
    /// samples that still fall inside the retention window and deleting
    /// log files that fell out of it entirely.
    pub fn open(data_dir: impl AsRef<Path>, retention: Duration) -> Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating store directory {}", data_dir.display()))?;

        let cutoff_ms = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let mut series: HashMap<String, SeriesData> = HashMap::new();

        let mut log_files = collect_log_files(&data_dir)?;
        log_files.sort();
        for (day, path) in log_files {
            // A file dated D holds nothing newer than the end of day D.
            let day_end_ms = day
                .succ_opt()
                .and_then(|next| next.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis())
                .unwrap_or(i64::MAX);
            if day_end_ms < cutoff_ms {
                debug!(file = %path.display(), "removing expired sample log");
                fs::remove_file(&path)
                    .with_context(|| format!("removing expired log {}", path.display()))?;
                continue;
            }
            load_log_file(&path, cutoff_ms, &mut series)?;
        }

        for data in series.values_mut() {
            data.samples
                .make_contiguous()
                .sort_by_key(|(ts, _)| *ts);
        }

        let today = Utc::now().date_naive();
        let writer = open_log_writer(&data_dir, today)?;

        Ok(Arc::new(TsStore {
            data_dir,
            retention,
            series: RwLock::new(series),
            log: Mutex::new(DailyLog { day: today, writer }),
        }))
    }

    /// Start a buffered write. Appends become visible only on commit.
    pub fn appender(self: &Arc<Self>) -> Appender {
        Appender {
            store: Arc::clone(self),
            pending: Vec::new(),
        }
    }

    /// Open a read view over `[mint, maxt]` (both bounds inclusive).
    pub fn querier(self: &Arc<Self>, mint: i64, maxt: i64) -> Querier {
        Querier {
            store: Arc::clone(self),
            mint,
            maxt,
        }
    }

    /// Flush the persistence log to disk.
    pub fn flush(&self) -> Result<()> {
        let mut log = self.log.lock().expect("store log poisoned");
        log.writer.flush().context("flushing sample log")?;
        Ok(())
    }

    fn commit(&self, pending: Vec<(Labels, i64, f64)>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut series = self.series.write().expect("store series poisoned");

        // Validate ordering for the whole batch before touching anything:
        // a commit is all-or-nothing.
        let mut last_ts: HashMap<String, i64> = HashMap::new();
        for (labels, ts, _) in &pending {
            let key = labels.key();
            let floor = last_ts
                .get(&key)
                .copied()
                .or_else(|| series.get(&key).and_then(|s| s.samples.back().map(|(t, _)| *t)));
            if let Some(floor) = floor {
                if *ts < floor {
                    bail!(
                        "out of order sample for series {:?}: {} < {}",
                        labels.get(NAME_LABEL).unwrap_or(""),
                        ts,
                        floor
                    );
                }
            }
            last_ts.insert(key, *ts);
        }

        {
            let mut log = self.log.lock().expect("store log poisoned");
            let today = Utc::now().date_naive();
            if log.day != today {
                log.writer.flush().context("flushing sample log")?;
                log.writer = open_log_writer(&self.data_dir, today)?;
                log.day = today;
            }
            for (labels, ts, value) in &pending {
                let row = SampleRow {
                    timestamp_ms: *ts,
                    labels: serde_json::to_string(labels).context("encoding labels")?,
                    value: *value,
                };
                log.writer.serialize(&row).context("writing sample log")?;
            }
            log.writer.flush().context("flushing sample log")?;
        }

        let cutoff_ms = Utc::now().timestamp_millis() - self.retention.as_millis() as i64;
        for (labels, ts, value) in pending {
            let key = labels.key();
            let data = series.entry(key).or_insert_with(|| SeriesData {
                labels,
                samples: VecDeque::new(),
            });
            data.samples.push_back((ts, value));
            while data
                .samples
                .front()
                .map(|(t, _)| *t < cutoff_ms)
                .unwrap_or(false)
            {
                data.samples.pop_front();
            }
        }

        Ok(())
    }
}

/// Buffered writer handed out by [`TsStore::appender`].
pub struct Appender {
    store: Arc<TsStore>,
    pending: Vec<(Labels, i64, f64)>,
}

impl Appender {
    pub fn append(&mut self, labels: Labels, timestamp_ms: i64, value: f64) {
        self.pending.push((labels, timestamp_ms, value));
    }

    /// Make all buffered samples visible atomically.
    pub fn commit(self) -> Result<()> {
        self.store.commit(self.pending)
    }

    /// Discard all buffered samples.
    pub fn rollback(self) {}
}

/// Read view over a fixed time window.
pub struct Querier {
    store: Arc<TsStore>,
    mint: i64,
    maxt: i64,
}

impl Querier {
    /// Return every series matching all `matchers`, with its samples
    /// restricted to the querier window in ascending timestamp order.
    /// Series with no samples inside the window are omitted.
    pub fn select(&self, matchers: &[Matcher]) -> Vec<Series> {
        let series = self.store.series.read().expect("store series poisoned");
        let mut out: Vec<Series> = Vec::new();
        for data in series.values() {
            if !matchers.iter().all(|m| m.matches(&data.labels)) {
                continue;
            }
            let samples: Vec<(i64, f64)> = data
                .samples
                .iter()
                .filter(|(ts, _)| *ts >= self.mint && *ts <= self.maxt)
                .copied()
                .collect();
            if samples.is_empty() {
                continue;
            }
            out.push(Series {
                labels: data.labels.clone(),
                samples,
            });
        }
        out.sort_by(|a, b| a.labels.key().cmp(&b.labels.key()));
        out
    }
}

fn collect_log_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date_part) = name
            .strip_prefix(FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        else {
            continue;
        };
        match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            Ok(day) => files.push((day, path)),
            Err(_) => warn!(file = %path.display(), "ignoring unrecognized file in store directory"),
        }
    }
    Ok(files)
}

fn load_log_file(
    path: &Path,
    cutoff_ms: i64,
    series: &mut HashMap<String, SeriesData>,
) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("opening sample log {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    for row in reader.deserialize() {
        let row: SampleRow = match row {
            Ok(row) => row,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping malformed sample row");
                continue;
            }
        };
        if row.timestamp_ms < cutoff_ms {
            continue;
        }
        let labels: Labels = match serde_json::from_str(&row.labels) {
            Ok(labels) => labels,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping row with malformed labels");
                continue;
            }
        };
        let data = series.entry(labels.key()).or_insert_with(|| SeriesData {
            labels,
            samples: VecDeque::new(),
        });
        data.samples.push_back((row.timestamp_ms, row.value));
    }
    Ok(())
}

fn open_log_writer(dir: &Path, day: NaiveDate) -> Result<csv::Writer<File>> {
    let path = dir.join(format!("{}{}{}", FILE_PREFIX, day.format("%Y-%m-%d"), FILE_SUFFIX));
    let file_has_data = path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening sample log {}", path.display()))?;

    Ok(WriterBuilder::new()
        .has_headers(!file_has_data)
        .from_writer(file))
}
