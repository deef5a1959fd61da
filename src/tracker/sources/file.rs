//! Manual-data file source
//!
//! Re-reads the operator-curated JSON file on every poll. The file may
//! carry its own timestamp (third JSON-path element), which the
//! scheduler uses for staleness checks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{DataSource, Parser, PricePoint};

pub struct JsonFileSource {
    path: PathBuf,
    id: String,
    parser: Box<dyn Parser>,
}

impl std::fmt::Debug for JsonFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileSource")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>, parser: Box<dyn Parser>) -> Self {
        let path = path.into();
        let id = path.display().to_string();
        JsonFileSource { path, id, parser }
    }
}

#[async_trait]
impl DataSource for JsonFileSource {
    async fn get(&self) -> Result<PricePoint> {
        let body = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading manual data file {}", self.path.display()))?;
        self.parser.parse(&body)
    }

    // Manual entries have no provider rate limit, so the global default
    // drives the cadence.
    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    fn source(&self) -> &str {
        &self.id
    }
}
