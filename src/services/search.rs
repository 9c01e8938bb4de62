//! Web-search adapter
//!
//! Queries the search endpoint (served by the speaker-ID microservice in
//! the default deployment) for a handful of results to ground answers
//! about current facts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;

/// Maximum results requested per query
pub const MAX_RESULTS: usize = 5;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(8);

/// One search hit
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// HTTP client for the search endpoint
#[derive(Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    config: SearchConfig,
}

impl SearchClient {
    pub fn new(config: SearchConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Run a query, returning at most [`MAX_RESULTS`] hits.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        debug!("Searching: \"{}\"", query);

        let response = self
            .client
            .get(format!("{}/search", self.config.url.trim_end_matches('/')))
            .query(&[("q", query), ("max", &MAX_RESULTS.to_string())])
            .send()
            .await
            .context("Search request failed")?;

        if !response.status().is_success() {
            bail!("Search error ({})", response.status());
        }

        let mut parsed: SearchResponse =
            response.json().await.context("Failed to parse search results")?;
        parsed.results.truncate(MAX_RESULTS);
        Ok(parsed.results)
    }
}
