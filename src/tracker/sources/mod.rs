//! Data source implementations (HTTP JSON, manual file, Uniswap, Balancer)

mod balancer;
mod file;
mod http;
mod uniswap;

pub use balancer::BalancerSource;
pub use file::JsonFileSource;
pub use http::JsonApiSource;
pub use uniswap::UniswapSource;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::contract::abigen;
use ethers::providers::{Http, Provider};
use ethers::types::U256;
use serde_json::Value;

/// Shared read-only chain client handed to on-chain sources.
pub type EthClient = Arc<Provider<Http>>;

/// One observation from a data source.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    pub volume: f64,
    /// Timestamp reported by the source itself; `None` when the source
    /// does not report one (most HTTP APIs).
    pub source_ts: Option<DateTime<Utc>>,
}

/// Trait for pollable price/volume sources.
#[async_trait]
pub trait DataSource: Send + Sync + std::fmt::Debug {
    /// Fetch the current price and volume.
    async fn get(&self) -> Result<PricePoint>;

    /// The recommended interval for calling `get`. Some APIs will return
    /// an error if called more often due to provider rate limiting.
    /// Zero means "inherit the global default".
    fn interval(&self) -> Duration;

    /// Canonical id of this source (URL, file path or pool address).
    fn source(&self) -> &str;
}

/// Trait for response-body parsers.
pub trait Parser: Send + Sync {
    fn parse(&self, input: &[u8]) -> Result<PricePoint>;
}

abigen!(
    Erc20Token,
    r#"[
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
    ]"#
);

pub(crate) fn u256_to_f64(value: U256) -> f64 {
    // A decimal digit string always parses as f64 (saturating for very
    // large values).
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

pub(crate) fn split_symbol(symbol: &str) -> Result<(&str, &str)> {
    symbol
        .split_once('/')
        .with_context(|| format!("symbol {:?} is not of the form BASE/QUOTE", symbol))
}

/// JSON-path parser over a subset grammar: `$` followed by `.field` and
/// `[index]` segments. The addressed value must be a numeric scalar or a
/// sequence of up to three numerics read positionally as
/// `(price, volume, unix-seconds)`.
pub struct JsonPathParser {
    param: String,
}

impl JsonPathParser {
    pub fn new(param: impl Into<String>) -> Self {
        JsonPathParser {
            param: param.into(),
        }
    }
}

impl Parser for JsonPathParser {
    fn parse(&self, input: &[u8]) -> Result<PricePoint> {
        let doc: Value = serde_json::from_slice(input).context("parsing response body")?;
        let result = eval_path(&doc, &self.param)?;

        let items: Vec<&Value> = match result {
            Value::Array(list) => list.iter().collect(),
            other => vec![other],
        };

        let mut price = 0.0;
        let mut volume = 0.0;
        let mut source_ts = None;
        for (i, item) in items.iter().take(3).enumerate() {
            match i {
                0 => price = numeric(item).context("price needs to be a valid number")?,
                1 => volume = numeric(item).context("volume needs to be a valid number")?,
                _ => {
                    let secs = numeric(item).context("timestamp needs to be a valid number")?;
                    if secs != 0.0 {
                        source_ts = Utc.timestamp_opt(secs as i64, 0).single();
                    }
                }
            }
        }

        Ok(PricePoint {
            price,
            volume,
            source_ts,
        })
    }
}

fn eval_path<'a>(doc: &'a Value, expr: &str) -> Result<&'a Value> {
    let rest = expr
        .trim()
        .strip_prefix('$')
        .with_context(|| format!("json path {:?} must start with '$'", expr))?;

    let mut value = doc;
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                let mut field = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '.' || c == '[' {
                        break;
                    }
                    field.push(c);
                    chars.next();
                }
                if field.is_empty() {
                    bail!("json path {:?}: empty field segment", expr);
                }
                value = value
                    .get(field.as_str())
                    .with_context(|| format!("json path {:?}: no field {:?}", expr, field))?;
            }
            '[' => {
                chars.next();
                let mut digits = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    digits.push(c);
                }
                let index: usize = digits
                    .trim()
                    .parse()
                    .with_context(|| format!("json path {:?}: bad index {:?}", expr, digits))?;
                value = value
                    .get(index)
                    .with_context(|| format!("json path {:?}: no index {}", expr, index))?;
            }
            other => bail!("json path {:?}: unexpected {:?}", expr, other),
        }
    }
    Ok(value)
}

fn numeric(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("{} is not representable as f64", n)),
        Value::String(s) => {
            // Normalize based on the american locale.
            let cleaned = s.replace(',', "");
            cleaned
                .parse::<f64>()
                .with_context(|| format!("{:?} is not a number", s))
        }
        other => bail!("{:?} is not a number", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_scalar() {
        let parser = JsonPathParser::new("$.data.price");
        let point = parser
            .parse(br#"{"data":{"price":123.4}}"#)
            .unwrap();
        assert_eq!(point.price, 123.4);
        assert_eq!(point.volume, 0.0);
        assert!(point.source_ts.is_none());
    }

    #[test]
    fn parses_string_with_thousand_separators() {
        let parser = JsonPathParser::new("$.p");
        let point = parser.parse(br#"{"p":"1,234.5"}"#).unwrap();
        assert_eq!(point.price, 1234.5);
    }

    #[test]
    fn parses_triple_with_timestamp() {
        let parser = JsonPathParser::new("$");
        let point = parser.parse(br#"[10.5, 300, 1600000000]"#).unwrap();
        assert_eq!(point.price, 10.5);
        assert_eq!(point.volume, 300.0);
        assert_eq!(point.source_ts.unwrap().timestamp(), 1_600_000_000);
    }

    #[test]
    fn missing_trailing_items_default_to_zero() {
        let parser = JsonPathParser::new("$");
        let point = parser.parse(br#"[10.5]"#).unwrap();
        assert_eq!(point.volume, 0.0);
        assert!(point.source_ts.is_none());

        let point = parser.parse(br#"[10.5, 2, 0]"#).unwrap();
        assert!(point.source_ts.is_none());
    }

    #[test]
    fn indexed_path_segments() {
        let parser = JsonPathParser::new("$.result[1].last");
        let point = parser
            .parse(br#"{"result":[{"last":1},{"last":2.5}]}"#)
            .unwrap();
        assert_eq!(point.price, 2.5);
    }

    #[test]
    fn non_numeric_result_is_fatal() {
        let parser = JsonPathParser::new("$.status");
        assert!(parser.parse(br#"{"status":"ok"}"#).is_err());
        assert!(parser.parse(br#"{"status":true}"#).is_err());
    }

    #[test]
    fn missing_path_is_fatal() {
        let parser = JsonPathParser::new("$.nope.price");
        assert!(parser.parse(br#"{"data":{}}"#).is_err());
    }

    #[test]
    fn malformed_body_is_fatal() {
        let parser = JsonPathParser::new("$.p");
        assert!(parser.parse(b"<html>rate limited</html>").is_err());
    }

    #[test]
    fn split_symbol_pairs() {
        assert_eq!(split_symbol("ETH/USD").unwrap(), ("ETH", "USD"));
        assert!(split_symbol("ETHUSD").is_err());
    }
}
