//! Core types used throughout OracleBot
//!
//! Symbol sanitization and duration handling shared by the catalog,
//! scheduler and aggregator.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Metric name suffix for price series.
pub const PRICE_SUFFIX: &str = "_price";
/// Metric name suffix for volume series.
pub const VOLUME_SUFFIX: &str = "_volume";
/// Metric name suffix for the per-symbol source count series.
pub const API_COUNT_SUFFIX: &str = "_api_count";

/// Sanitize a symbol into a metric-name-safe form.
///
/// Anything outside `[a-zA-Z0-9_:]` becomes `_`; a leading digit gets a
/// `_` prefix so the result is a valid metric name.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    for (i, c) in name.chars().enumerate() {
        let valid = c.is_ascii_alphanumeric() || c == '_' || c == ':';
        if i == 0 && c.is_ascii_digit() {
            out.push('_');
        }
        out.push(if valid { c } else { '_' });
    }
    out
}

/// A duration that deserializes from either a bare number (seconds) or a
/// human-readable string such as `"30s"`, `"500ms"`, `"1m30s"` or `"2h"`.
///
/// Zero means "inherit the global default" wherever a `DurationSpec` is
/// used as a polling interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationSpec(pub Duration);

impl DurationSpec {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for DurationSpec {
    fn from(d: Duration) -> Self {
        DurationSpec(d)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Parse a human-readable duration: one or more `<number><unit>` segments
/// with units `ms`, `s`, `m`, `h`; a bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    // Bare integer means seconds.
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            bail!("invalid duration {:?}: expected a number", input);
        }
        let value: u64 = digits.parse()?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let segment = match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" | "" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => bail!("invalid duration {:?}: unknown unit {:?}", input, other),
        };
        total += segment;
    }
    Ok(total)
}

impl<'de> Deserialize<'de> for DurationSpec {
    fn deserialize<D>(deserializer: D) -> Result<DurationSpec, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SpecVisitor;

        impl<'de> Visitor<'de> for SpecVisitor {
            type Value = DurationSpec;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"30s\" or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DurationSpec, E> {
                Ok(DurationSpec(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<DurationSpec, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(DurationSpec(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<DurationSpec, E> {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(DurationSpec(Duration::from_secs_f64(v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DurationSpec, E> {
                parse_duration(v).map(DurationSpec).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SpecVisitor)
    }
}
