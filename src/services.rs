//! Handles to every external service, built once and passed to the HTTP
//! layer and CLI commands.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::completion::{AzureOpenAiClient, CompletionClient};
use crate::config::Config;
use crate::layout::{AzureLayoutAnalyzer, LayoutAnalyzer};
use crate::search::{AzureSearch, SearchService};
use crate::store::azure::AzureBlobStore;
use crate::store::BlobStore;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn BlobStore>,
    pub search: Arc<dyn SearchService>,
    /// Absent when no `[layout]` section is configured.
    pub layout: Option<Arc<dyn LayoutAnalyzer>>,
    pub completion: Arc<dyn CompletionClient>,
}

impl Services {
    /// Build Azure-backed clients sharing one HTTP connection pool.
    ///
    /// Fails when a credential environment variable is missing.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let store = AzureBlobStore::new(&config.storage, client.clone())?;
        let search = AzureSearch::new(&config.search, client.clone())?;
        let layout = match &config.layout {
            Some(layout) => Some(
                Arc::new(AzureLayoutAnalyzer::new(layout, client.clone())?)
                    as Arc<dyn LayoutAnalyzer>,
            ),
            None => None,
        };
        let completion = AzureOpenAiClient::new(&config.completion, client)?;

        Ok(Self {
            store: Arc::new(store),
            search: Arc::new(search),
            layout,
            completion: Arc::new(completion),
        })
    }
}
