//! Retrieval and reindexing against the managed search service.
//!
//! No local index is kept. Queries go to the service and come back in its
//! relevance order; mutations are followed by an indexer run request so the
//! index eventually picks up what changed in the blob container.
//!
//! # Environment Variables
//!
//! - `AZURE_SEARCH_KEY`: admin key, sent as the `api-key` header

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::SearchConfig;
use crate::models::IndexerRun;

/// One record returned by a search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub content: String,
}

impl SearchHit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Top `top_k` records for a free-text query, most relevant first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>>;

    /// Ask the service to run its indexer. Never fails: transport and service
    /// errors are reported through the returned [`IndexerRun`].
    async fn run_indexer(&self) -> IndexerRun;
}

// ============ Azure AI Search ============

/// Azure AI Search index plus the indexer that feeds it from blob storage.
pub struct AzureSearch {
    client: reqwest::Client,
    endpoint: String,
    index: String,
    indexer: String,
    api_version: String,
    api_key: String,
    content_field: String,
}

impl AzureSearch {
    pub fn new(config: &SearchConfig, client: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("AZURE_SEARCH_KEY")
            .context("AZURE_SEARCH_KEY environment variable not set")?;
        Ok(Self::with_key(config, client, api_key))
    }

    pub fn with_key(config: &SearchConfig, client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            indexer: config.indexer.clone(),
            api_version: config.api_version.clone(),
            api_key,
            content_field: config.content_field.clone(),
        }
    }

    fn search_url(&self) -> String {
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.endpoint, self.index, self.api_version
        )
    }

    fn indexer_run_url(&self) -> String {
        format!(
            "{}/indexers/{}/run?api-version={}",
            self.endpoint, self.indexer, self.api_version
        )
    }
}

#[async_trait]
impl SearchService for AzureSearch {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let body = serde_json::json!({
            "search": query,
            "top": top_k,
        });

        tracing::debug!(index = %self.index, top_k, "querying search index");
        let resp = self
            .client
            .post(self.search_url())
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Search request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Search service error {}: {}", status, text);
        }

        let json: serde_json::Value = resp.json().await?;
        parse_search_response(&json, &self.content_field)
    }

    async fn run_indexer(&self) -> IndexerRun {
        let resp = self
            .client
            .post(self.indexer_run_url())
            .header("api-key", &self.api_key)
            .body("")
            .send()
            .await;

        match resp {
            Ok(response) if response.status() == reqwest::StatusCode::ACCEPTED => {
                tracing::info!(indexer = %self.indexer, "indexer run triggered");
                IndexerRun::triggered()
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                tracing::warn!(indexer = %self.indexer, %status, "indexer run rejected");
                IndexerRun::failed(text)
            }
            Err(e) => {
                tracing::warn!(indexer = %self.indexer, error = %e, "indexer run request failed");
                IndexerRun::failed(e.to_string())
            }
        }
    }
}

/// Parse a search response body's `value[]` into hits.
///
/// Records without a string content field contribute an empty string so the
/// relevance order of the remaining records is preserved.
pub fn parse_search_response(
    json: &serde_json::Value,
    content_field: &str,
) -> Result<Vec<SearchHit>> {
    let values = json
        .get("value")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid search response: missing value array"))?;

    Ok(values
        .iter()
        .map(|record| {
            SearchHit::new(
                record
                    .get(content_field)
                    .and_then(|c| c.as_str())
                    .unwrap_or_default(),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hits_in_service_order() {
        let json = serde_json::json!({
            "@odata.context": "x",
            "value": [
                {"@search.score": 3.2, "content": "Leave policy", "metadata_storage_name": "policy.txt_part1.txt"},
                {"@search.score": 1.1, "content": "Payroll"},
                {"@search.score": 0.4}
            ]
        });
        let hits = parse_search_response(&json, "content").unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["Leave policy", "Payroll", ""]);
    }

    #[test]
    fn missing_value_array_is_error() {
        let json = serde_json::json!({"error": {"message": "bad"}});
        assert!(parse_search_response(&json, "content").is_err());
    }

    #[test]
    fn urls_include_api_version() {
        let config = SearchConfig {
            endpoint: "https://s.search.windows.net/".into(),
            index: "idx".into(),
            indexer: "ixr".into(),
            api_version: "2023-11-01".into(),
            top_k: 5,
            content_field: "content".into(),
        };
        let search = AzureSearch::with_key(&config, reqwest::Client::new(), "k".into());
        assert_eq!(
            search.search_url(),
            "https://s.search.windows.net/indexes/idx/docs/search?api-version=2023-11-01"
        );
        assert_eq!(
            search.indexer_run_url(),
            "https://s.search.windows.net/indexers/ixr/run?api-version=2023-11-01"
        );
    }
}
