//! Layout analysis for formats without an in-process extractor.
//!
//! The analyzer is handed a URL the service can fetch the original file from
//! (a signed read URL on a staging object), submits it to the layout model and
//! polls the returned operation until it finishes.
//!
//! Result text: when the analysis found tables, every table is rendered as
//! one ` | `-joined line per row and tables are separated by a blank line;
//! page text is discarded. Otherwise the page content is returned as-is.
//!
//! # Environment Variables
//!
//! - `AZURE_DOCINTEL_KEY`: sent as `Ocp-Apim-Subscription-Key`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::LayoutConfig;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutResult {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tables: Vec<LayoutTable>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutTable {
    pub row_count: usize,
    pub column_count: usize,
    #[serde(default)]
    pub cells: Vec<LayoutCell>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutCell {
    pub row_index: usize,
    pub column_index: usize,
    #[serde(default)]
    pub content: String,
}

impl LayoutTable {
    /// Render rows as ` | `-joined lines. Positions without a cell are empty;
    /// when several cells claim a position the first one wins.
    pub fn to_text(&self) -> String {
        (0..self.row_count)
            .map(|row| {
                (0..self.column_count)
                    .map(|col| {
                        self.cells
                            .iter()
                            .find(|c| c.row_index == row && c.column_index == col)
                            .map(|c| c.content.as_str())
                            .unwrap_or("")
                    })
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl LayoutResult {
    pub fn to_text(&self) -> String {
        if self.tables.is_empty() {
            return self.content.clone();
        }
        self.tables
            .iter()
            .map(LayoutTable::to_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait LayoutAnalyzer: Send + Sync {
    /// Analyze the document at `url` and return its extracted text.
    async fn analyze_url(&self, url: &str) -> Result<String>;
}

// ============ Azure Document Intelligence ============

pub struct AzureLayoutAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_version: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl AzureLayoutAnalyzer {
    pub fn new(config: &LayoutConfig, client: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("AZURE_DOCINTEL_KEY")
            .context("AZURE_DOCINTEL_KEY environment variable not set")?;
        Ok(Self::with_key(config, client, api_key))
    }

    pub fn with_key(config: &LayoutConfig, client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_version: config.api_version.clone(),
            api_key,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        }
    }

    /// Analyze endpoint. API versions from 2024 on moved to the
    /// `documentintelligence` path.
    fn analyze_url_for(&self) -> String {
        let service = if self.api_version.as_str() >= "2024" {
            "documentintelligence"
        } else {
            "formrecognizer"
        };
        format!(
            "{}/{}/documentModels/{}:analyze?api-version={}",
            self.endpoint, service, self.model, self.api_version
        )
    }

    async fn submit(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .post(self.analyze_url_for())
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(&serde_json::json!({ "urlSource": url }))
            .send()
            .await
            .context("Layout analysis request failed")?;

        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED {
            let text = resp.text().await.unwrap_or_default();
            bail!("Layout analysis rejected ({}): {}", status, text);
        }

        resp.headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Layout analysis response has no Operation-Location"))
    }

    async fn poll(&self, operation: &str) -> Result<LayoutResult> {
        for _ in 0..self.max_polls {
            let resp = self
                .client
                .get(operation)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .send()
                .await
                .context("Layout analysis poll failed")?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                bail!("Layout analysis poll error {}: {}", status, text);
            }

            let json: serde_json::Value = resp.json().await?;
            if let Some(result) = parse_operation(&json)? {
                return Ok(result);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        bail!(
            "Layout analysis did not finish after {} polls",
            self.max_polls
        )
    }
}

#[async_trait]
impl LayoutAnalyzer for AzureLayoutAnalyzer {
    async fn analyze_url(&self, url: &str) -> Result<String> {
        let operation = self.submit(url).await?;
        tracing::debug!(%operation, "layout analysis submitted");
        let result = self.poll(&operation).await?;
        Ok(result.to_text())
    }
}

/// Interpret one poll response. `Ok(None)` means the operation is still running.
fn parse_operation(json: &serde_json::Value) -> Result<Option<LayoutResult>> {
    let status = json
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or_default();

    match status {
        "succeeded" => {
            let result = json
                .get("analyzeResult")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Layout analysis succeeded without analyzeResult"))?;
            Ok(Some(serde_json::from_value(result)?))
        }
        "failed" | "canceled" => {
            let detail = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("no detail");
            bail!("Layout analysis {}: {}", status, detail)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(row: usize, col: usize, content: &str) -> LayoutCell {
        LayoutCell {
            row_index: row,
            column_index: col,
            content: content.to_string(),
        }
    }

    #[test]
    fn tables_take_precedence_over_content() {
        let result = LayoutResult {
            content: "page text".into(),
            tables: vec![
                LayoutTable {
                    row_count: 2,
                    column_count: 2,
                    cells: vec![
                        cell(0, 0, "Name"),
                        cell(0, 1, "Role"),
                        cell(1, 0, "Ada"),
                        cell(1, 1, "Engineer"),
                    ],
                },
                LayoutTable {
                    row_count: 1,
                    column_count: 3,
                    cells: vec![cell(0, 0, "x"), cell(0, 2, "z")],
                },
            ],
        };
        assert_eq!(
            result.to_text(),
            "Name | Role\nAda | Engineer\n\nx |  | z"
        );
    }

    #[test]
    fn content_used_without_tables() {
        let result = LayoutResult {
            content: "Scanned letter".into(),
            tables: vec![],
        };
        assert_eq!(result.to_text(), "Scanned letter");
    }

    #[test]
    fn operation_states() {
        let running = serde_json::json!({"status": "running"});
        assert!(parse_operation(&running).unwrap().is_none());

        let done = serde_json::json!({
            "status": "succeeded",
            "analyzeResult": {
                "content": "hello",
                "tables": [{
                    "rowCount": 1,
                    "columnCount": 1,
                    "cells": [{"rowIndex": 0, "columnIndex": 0, "content": "only"}]
                }]
            }
        });
        let result = parse_operation(&done).unwrap().unwrap();
        assert_eq!(result.to_text(), "only");

        let failed = serde_json::json!({"status": "failed", "error": {"message": "corrupt"}});
        let err = parse_operation(&failed).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn analyze_path_depends_on_api_version() {
        let mut config = LayoutConfig {
            endpoint: "https://di.example.net/".into(),
            model: "prebuilt-layout".into(),
            api_version: "2023-07-31".into(),
            poll_interval_ms: 10,
            max_polls: 3,
        };
        let analyzer =
            AzureLayoutAnalyzer::with_key(&config, reqwest::Client::new(), "k".into());
        assert_eq!(
            analyzer.analyze_url_for(),
            "https://di.example.net/formrecognizer/documentModels/prebuilt-layout:analyze?api-version=2023-07-31"
        );

        config.api_version = "2024-11-30".into();
        let analyzer =
            AzureLayoutAnalyzer::with_key(&config, reqwest::Client::new(), "k".into());
        assert!(analyzer
            .analyze_url_for()
            .contains("/documentintelligence/documentModels/"));
    }
}
