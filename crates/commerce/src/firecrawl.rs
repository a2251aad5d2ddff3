//! Firecrawl web search client, used only for product research.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use poltergeist_core::config::FirecrawlConfig;
use poltergeist_core::domain::product::ProductCandidate;

use crate::error::CommerceError;

#[derive(Clone)]
pub struct FirecrawlClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    search_limit: u32,
}

impl FirecrawlClient {
    pub fn new(config: &FirecrawlConfig) -> Result<Self, CommerceError> {
        let http =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            search_limit: config.search_limit,
        })
    }

    pub async fn search(&self, query: &str) -> Result<Vec<ProductCandidate>, CommerceError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            CommerceError::MissingCredentials(
                "FIRECRAWL_API_KEY is not configured; product research is unavailable".to_string(),
            )
        })?;

        debug!(%query, limit = self.search_limit, "firecrawl search");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key.expose_secret())
            .json(&json!({ "query": query, "limit": self.search_limit }))
            .send()
            .await?
            .error_for_status()?;

        let envelope: SearchResponse = response.json().await?;
        Ok(candidates_from_results(envelope.data))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    title: Option<String>,
    url: Option<String>,
    description: Option<String>,
}

fn candidates_from_results(results: Vec<SearchResult>) -> Vec<ProductCandidate> {
    results
        .into_iter()
        .filter_map(|result| {
            // A hit without a URL is useless for tracking; drop it.
            let url = result.url?;
            Some(ProductCandidate {
                title: result.title.unwrap_or_else(|| "N/A".to_string()),
                url,
                snippet: result.description.unwrap_or_default(),
            })
        })
        .collect()
}
