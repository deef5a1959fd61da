//! Process-wide metric registry for the index tracker
//!
//! Gauges reflect the last successful sample per data source; the error
//! counter tracks failed fetches. Statics register exactly once for the
//! process lifetime, so repeated component construction (e.g. in tests)
//! never trips duplicate registration.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec, Opts};

const NAMESPACE: &str = "oraclebot";
const SUBSYSTEM: &str = "indexTracker";

lazy_static! {
    pub static ref TRACKER_PRICE: GaugeVec = register_gauge_vec!(
        Opts::new("price", "The currency price")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["source"]
    )
    .unwrap();

    pub static ref TRACKER_VOLUME: GaugeVec = register_gauge_vec!(
        Opts::new("volume", "The currency trade amount")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["source"]
    )
    .unwrap();

    pub static ref TRACKER_ERRORS: CounterVec = register_counter_vec!(
        Opts::new(
            "errors_total",
            "The total number of get errors. Usually caused by API throttling."
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM),
        &["source"]
    )
    .unwrap();
}

/// Record the last successful sample for a data source.
pub fn record_sample(source: &str, price: f64, volume: f64) {
    TRACKER_PRICE.with_label_values(&[source]).set(price);
    TRACKER_VOLUME.with_label_values(&[source]).set(volume);
}

/// Record a failed fetch for a data source.
pub fn record_fetch_error(source: &str) {
    TRACKER_ERRORS.with_label_values(&[source]).inc();
}

/// Current value of the fetch error counter for a data source.
pub fn fetch_errors(source: &str) -> f64 {
    TRACKER_ERRORS.with_label_values(&[source]).get()
}
