//! Uniswap V2 pool source
//!
//! Reads the pair contract at the resolved address and derives the spot
//! price of the tracked symbol from the reserves. The pool's quote-side
//! depth is exposed as the volume figure.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::types::Address;
use tokio::sync::OnceCell;

use super::{split_symbol, u256_to_f64, DataSource, Erc20Token, EthClient, PricePoint};

abigen!(
    UniswapV2Pair,
    r#"[
        function getReserves() external view returns (uint256, uint256, uint256)
        function token0() external view returns (address)
        function token1() external view returns (address)
    ]"#
);

#[derive(Debug)]
struct PairMeta {
    base_is_token0: bool,
    base_decimals: u8,
    quote_decimals: u8,
}

#[derive(Debug)]
pub struct UniswapSource {
    symbol: String,
    id: String,
    address: Address,
    interval: Duration,
    client: EthClient,
    meta: OnceCell<PairMeta>,
}

impl UniswapSource {
    pub fn new(
        symbol: impl Into<String>,
        address: Address,
        interval: Duration,
        client: EthClient,
    ) -> Self {
        UniswapSource {
            symbol: symbol.into(),
            id: format!("uniswap:{:#x}", address),
            address,
            interval,
            client,
            meta: OnceCell::new(),
        }
    }

    /// Token ordering and decimals never change for a deployed pair, so
    /// they are resolved once and cached.
    async fn pair_meta(&self) -> Result<&PairMeta> {
        self.meta
            .get_or_try_init(|| async {
                let pair = UniswapV2Pair::new(self.address, self.client.clone());
                let token0: Address = pair
                    .token_0()
                    .call()
                    .await
                    .with_context(|| format!("querying token0 of {}", self.id))?;
                let token1: Address = pair
                    .token_1()
                    .call()
                    .await
                    .with_context(|| format!("querying token1 of {}", self.id))?;

                let (sym0, dec0) = token_meta(&self.client, token0).await?;
                let (sym1, dec1) = token_meta(&self.client, token1).await?;

                let (base, _quote) = split_symbol(&self.symbol)?;
                let base_is_token0 = if symbol_matches(&sym0, base) {
                    true
                } else if symbol_matches(&sym1, base) {
                    false
                } else {
                    bail!(
                        "pair {}/{} at {} does not contain {}",
                        sym0,
                        sym1,
                        self.id,
                        base
                    );
                };

                let (base_decimals, quote_decimals) = if base_is_token0 {
                    (dec0, dec1)
                } else {
                    (dec1, dec0)
                };
                Ok(PairMeta {
                    base_is_token0,
                    base_decimals,
                    quote_decimals,
                })
            })
            .await
    }
}

#[async_trait]
impl DataSource for UniswapSource {
    async fn get(&self) -> Result<PricePoint> {
        let meta = self.pair_meta().await?;
        let pair = UniswapV2Pair::new(self.address, self.client.clone());
        let (reserve0, reserve1, _) = pair
            .get_reserves()
            .call()
            .await
            .with_context(|| format!("querying reserves of {}", self.id))?;

        let (base_raw, quote_raw) = if meta.base_is_token0 {
            (reserve0, reserve1)
        } else {
            (reserve1, reserve0)
        };
        let base_units = u256_to_f64(base_raw) / 10f64.powi(meta.base_decimals as i32);
        let quote_units = u256_to_f64(quote_raw) / 10f64.powi(meta.quote_decimals as i32);
        if base_units == 0.0 {
            bail!("pool {} has no base-side reserves", self.id);
        }

        Ok(PricePoint {
            price: quote_units / base_units,
            volume: quote_units,
            source_ts: None,
        })
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn source(&self) -> &str {
        &self.id
    }
}

async fn token_meta(client: &EthClient, token: Address) -> Result<(String, u8)> {
    let erc20 = Erc20Token::new(token, client.clone());
    let symbol = erc20
        .symbol()
        .call()
        .await
        .with_context(|| format!("querying symbol of {:#x}", token))?;
    let decimals = erc20
        .decimals()
        .call()
        .await
        .with_context(|| format!("querying decimals of {:#x}", token))?;
    Ok((symbol, decimals))
}

/// Match a pool token against the tracked base asset, accepting the
/// wrapped form (ETH vs WETH).
fn symbol_matches(token_symbol: &str, asset: &str) -> bool {
    token_symbol.eq_ignore_ascii_case(asset)
        || token_symbol.eq_ignore_ascii_case(&format!("W{}", asset))
}
