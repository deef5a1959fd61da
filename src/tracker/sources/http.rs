//! HTTP JSON data source
//!
//! Polls a JSON API and hands the body to the configured parser.
//! Transport failures get a short bounded retry window; HTTP error
//! statuses and parse failures surface immediately so the scheduler
//! counts one error per tick.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{DataSource, Parser, PricePoint};

const FETCH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct JsonApiSource {
    url: String,
    interval: Duration,
    fetch_timeout: Duration,
    client: reqwest::Client,
    parser: Box<dyn Parser>,
}

impl std::fmt::Debug for JsonApiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonApiSource")
            .field("url", &self.url)
            .field("interval", &self.interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}

impl JsonApiSource {
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        fetch_timeout: Duration,
        parser: Box<dyn Parser>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .context("creating HTTP client")?;

        Ok(JsonApiSource {
            url: url.into(),
            interval,
            fetch_timeout,
            client,
            parser,
        })
    }

    async fn fetch_with_retry(&self) -> Result<Vec<u8>> {
        let mut attempt = 1;
        let response = loop {
            match self.client.get(&self.url).send().await {
                Ok(response) => break response,
                Err(e) if attempt < FETCH_ATTEMPTS => {
                    debug!(url = %self.url, attempt, error = %e, "request failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e).with_context(|| format!("requesting {}", self.url)),
            }
        };

        let response = response
            .error_for_status()
            .with_context(|| format!("requesting {}", self.url))?;
        let body = response.bytes().await.context("reading response body")?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl DataSource for JsonApiSource {
    async fn get(&self) -> Result<PricePoint> {
        // The whole retry window is bounded by the fetch timeout.
        let body = tokio::time::timeout(self.fetch_timeout, self.fetch_with_retry())
            .await
            .map_err(|_| {
                anyhow!(
                    "fetching {} exceeded the {:?} budget",
                    self.url,
                    self.fetch_timeout
                )
            })??;
        self.parser.parse(&body)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn source(&self) -> &str {
        &self.url
    }
}
