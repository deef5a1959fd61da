//! Balancer pool source
//!
//! Reads the pool's spot price for the tracked pair. The pool balance of
//! the quote token is exposed as the volume figure.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::types::Address;
use tokio::sync::OnceCell;

use super::{split_symbol, u256_to_f64, DataSource, Erc20Token, EthClient, PricePoint};

abigen!(
    BalancerPool,
    r#"[
        function getCurrentTokens() external view returns (address[])
        function getSpotPrice(address tokenIn, address tokenOut) external view returns (uint256)
        function getBalance(address token) external view returns (uint256)
    ]"#
);

// Balancer fixed-point scale (BONE).
const SPOT_PRICE_SCALE: f64 = 1e18;

#[derive(Debug)]
struct PoolMeta {
    base: Address,
    quote: Address,
    base_decimals: u8,
    quote_decimals: u8,
}

#[derive(Debug)]
pub struct BalancerSource {
    symbol: String,
    id: String,
    address: Address,
    interval: Duration,
    client: EthClient,
    meta: OnceCell<PoolMeta>,
}

impl BalancerSource {
    pub fn new(
        symbol: impl Into<String>,
        address: Address,
        interval: Duration,
        client: EthClient,
    ) -> Self {
        BalancerSource {
            symbol: symbol.into(),
            id: format!("balancer:{:#x}", address),
            address,
            interval,
            client,
            meta: OnceCell::new(),
        }
    }

    async fn pool_meta(&self) -> Result<&PoolMeta> {
        self.meta
            .get_or_try_init(|| async {
                let pool = BalancerPool::new(self.address, self.client.clone());
                let tokens: Vec<Address> = pool
                    .get_current_tokens()
                    .call()
                    .await
                    .with_context(|| format!("querying tokens of {}", self.id))?;

                let (base_asset, quote_asset) = split_symbol(&self.symbol)?;
                let mut base = None;
                let mut quote = None;
                for token in tokens {
                    let erc20 = Erc20Token::new(token, self.client.clone());
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
                    if base.is_none() && base_matches(&symbol, base_asset) {
                        base = Some((token, decimals));
                    } else if quote.is_none() && quote_matches(&symbol, quote_asset) {
                        quote = Some((token, decimals));
                    }
                }

                let (base, base_decimals) = base.with_context(|| {
                    format!("pool {} holds no token for {}", self.id, base_asset)
                })?;
                let (quote, quote_decimals) = quote.with_context(|| {
                    format!("pool {} holds no token for {}", self.id, quote_asset)
                })?;
                Ok(PoolMeta {
                    base,
                    quote,
                    base_decimals,
                    quote_decimals,
                })
            })
            .await
    }
}

#[async_trait]
impl DataSource for BalancerSource {
    async fn get(&self) -> Result<PricePoint> {
        let meta = self.pool_meta().await?;
        let pool = BalancerPool::new(self.address, self.client.clone());

        // Spot price is quote-in per base-out in raw token units, scaled
        // by BONE; decimals shift it back into human units.
        let spot = pool
            .get_spot_price(meta.quote, meta.base)
            .call()
            .await
            .with_context(|| format!("querying spot price of {}", self.id))?;
        let price = u256_to_f64(spot) / SPOT_PRICE_SCALE
            * 10f64.powi(meta.base_decimals as i32 - meta.quote_decimals as i32);

        let balance = pool
            .get_balance(meta.quote)
            .call()
            .await
            .with_context(|| format!("querying balance of {}", self.id))?;
        let volume = u256_to_f64(balance) / 10f64.powi(meta.quote_decimals as i32);

        if price == 0.0 {
            bail!("pool {} returned a zero spot price", self.id);
        }

        Ok(PricePoint {
            price,
            volume,
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

fn base_matches(token_symbol: &str, asset: &str) -> bool {
    token_symbol.eq_ignore_ascii_case(asset)
        || token_symbol.eq_ignore_ascii_case(&format!("W{}", asset))
}

/// Stablecoin tickers extend the quote asset (USD matches USDC/USDT).
fn quote_matches(token_symbol: &str, asset: &str) -> bool {
    let token = token_symbol.to_ascii_uppercase();
    let asset = asset.to_ascii_uppercase();
    token == asset || token.starts_with(&asset) || token == format!("W{}", asset)
}
