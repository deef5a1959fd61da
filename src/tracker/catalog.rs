//! Source catalog loader
//!
//! Parses the declarative catalog mapping each tracked symbol to its
//! data-source descriptors and instantiates the pollers. Descriptors
//! live for the process lifetime and are never mutated after load.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::providers::Middleware;
use ethers::types::Address;
use serde::Deserialize;
use thiserror::Error;

use super::sources::{
    BalancerSource, DataSource, EthClient, JsonApiSource, JsonFileSource, JsonPathParser, Parser,
    UniswapSource,
};
use crate::config::TrackerConfig;
use crate::types::DurationSpec;

const HTTP_SOURCE: &str = "http";
const ETHEREUM_SOURCE: &str = "ethereum";
const MANUAL_SOURCE: &str = "manualData";

const JSON_PATH_PARSER: &str = "jsonPath";
const UNISWAP_PARSER: &str = "Uniswap";
const BALANCER_PARSER: &str = "Balancer";

/// One catalog entry: where and how to poll a value for a symbol.
/// Unknown fields are rejected so typos surface at startup instead of
/// silently changing behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescriptor {
    /// For `http`: a URL (may reference `${ENV_VAR}` bindings). For
    /// `ethereum`: a JSON map of network id to contract address. Unused
    /// for `manualData`.
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub parser: String,
    #[serde(default)]
    pub param: String,
    /// Zero or omitted inherits the global default interval.
    #[serde(default)]
    pub interval: DurationSpec,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown source type {0:?}")]
    UnknownType(String),
    #[error("unknown parser {0:?} for source type {1:?}")]
    UnknownParser(String, String),
    #[error("no address for network id {network_id} in {url:?}")]
    AddressNotForNetwork { network_id: u64, url: String },
    #[error("invalid contract address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("catalog has an on-chain source but no chain client is configured")]
    NoChainClient,
    #[error("querying network id: {0}")]
    NetworkId(String),
    #[error("creating source: {0}")]
    Source(#[source] anyhow::Error),
}

/// Build every data source declared in the catalog file.
///
/// On-chain descriptors are rebound to the contract address matching the
/// network id reported by the chain client.
pub async fn create_data_sources(
    cfg: &TrackerConfig,
    client: Option<EthClient>,
) -> Result<HashMap<String, Vec<Arc<dyn DataSource>>>, CatalogError> {
    let bytes = std::fs::read(&cfg.api_file).map_err(|e| CatalogError::Unreadable {
        path: cfg.api_file.clone(),
        source: e,
    })?;
    let catalog: HashMap<String, Vec<SourceDescriptor>> = serde_json::from_slice(&bytes)?;

    // Resolved lazily so http-only catalogs never touch the chain.
    let mut network_id: Option<u64> = None;

    let mut data_sources: HashMap<String, Vec<Arc<dyn DataSource>>> = HashMap::new();
    for (symbol, descriptors) in catalog {
        for mut descriptor in descriptors {
            descriptor.url = expand_env(&descriptor.url);
            if descriptor.kind.is_empty() {
                descriptor.kind = HTTP_SOURCE.to_string();
            }
            if descriptor.parser.is_empty() {
                descriptor.parser = JSON_PATH_PARSER.to_string();
            }
            let interval = if descriptor.interval.is_zero() {
                cfg.interval()
            } else {
                descriptor.interval.duration()
            };

            let source: Arc<dyn DataSource> = match descriptor.kind.as_str() {
                HTTP_SOURCE => {
                    let parser = new_json_parser(&descriptor)?;
                    Arc::new(
                        JsonApiSource::new(
                            descriptor.url.as_str(),
                            interval,
                            cfg.fetch_timeout(),
                            parser,
                        )
                        .map_err(CatalogError::Source)?,
                    )
                }
                MANUAL_SOURCE => {
                    let parser = new_json_parser(&descriptor)?;
                    Arc::new(JsonFileSource::new(&cfg.manual_data_file, parser))
                }
                ETHEREUM_SOURCE => {
                    let client = client.clone().ok_or(CatalogError::NoChainClient)?;
                    let id = match network_id {
                        Some(id) => id,
                        None => {
                            let id = client
                                .get_chainid()
                                .await
                                .map_err(|e| CatalogError::NetworkId(e.to_string()))?
                                .as_u64();
                            network_id = Some(id);
                            id
                        }
                    };
                    let address = address_for_network(&descriptor.url, id)?;
                    match descriptor.parser.as_str() {
                        UNISWAP_PARSER => Arc::new(UniswapSource::new(
                            symbol.as_str(),
                            address,
                            interval,
                            client,
                        )),
                        BALANCER_PARSER => Arc::new(BalancerSource::new(
                            symbol.as_str(),
                            address,
                            interval,
                            client,
                        )),
                        other => {
                            return Err(CatalogError::UnknownParser(
                                other.to_string(),
                                descriptor.kind.clone(),
                            ))
                        }
                    }
                }
                other => return Err(CatalogError::UnknownType(other.to_string())),
            };

            data_sources.entry(symbol.clone()).or_default().push(source);
        }
    }
    Ok(data_sources)
}

fn new_json_parser(descriptor: &SourceDescriptor) -> Result<Box<dyn Parser>, CatalogError> {
    match descriptor.parser.as_str() {
        JSON_PATH_PARSER => Ok(Box::new(JsonPathParser::new(descriptor.param.as_str()))),
        other => Err(CatalogError::UnknownParser(
            other.to_string(),
            descriptor.kind.clone(),
        )),
    }
}

/// Pick the contract address bound to the active network from an
/// `{"<network-id>": "<address>"}` map.
fn address_for_network(url: &str, network_id: u64) -> Result<Address, CatalogError> {
    let addresses: HashMap<String, String> = serde_json::from_str(url)?;
    let raw = addresses
        .get(&network_id.to_string())
        .ok_or_else(|| CatalogError::AddressNotForNetwork {
            network_id,
            url: url.to_string(),
        })?;
    raw.parse::<Address>()
        .map_err(|e| CatalogError::InvalidAddress {
            address: raw.clone(),
            reason: e.to_string(),
        })
}

/// Substitute `${NAME}` occurrences with the current process
/// environment; undefined references resolve to empty.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if closed {
                out.push_str(&std::env::var(&name).unwrap_or_default());
            } else {
                // Unterminated reference, keep the literal text.
                out.push_str("${");
                out.push_str(&name);
            }
        } else {
            out.push(c);
        }
    }
    out
}
