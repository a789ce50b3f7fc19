//! Upload pipeline.
//!
//! A batch is processed in two phases:
//!
//! 1. **Extract** every file. Formats with an in-process extractor are decoded
//!    on the blocking pool. Other formats are staged in the blob store, handed
//!    to the layout analyzer through a signed read URL, and the staging object
//!    is removed afterwards whatever the outcome.
//! 2. **Store** the chunks of every extracted file as
//!    `{classification}/{filename}_part{N}.txt`, then delete parts left over
//!    from an earlier, longer version of the same document.
//!
//! A local extractor failure aborts the batch before phase 2, so nothing is
//! written. Layout-analysis failures only fail their own file and are reported
//! in the batch result. One indexer run is requested per completed batch.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;

use crate::chunk::{chunk_document, ChunkObject};
use crate::config::Config;
use crate::extract::{extract_local, ExtractError, FileKind};
use crate::layout::LayoutAnalyzer;
use crate::models::{FileOutcome, UploadReport};
use crate::naming::{chunk_prefix, parse_part_name, split_object_name, staging_object_name};
use crate::search::SearchService;
use crate::store::{BlobStore, Metadata};

const CHUNK_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Reason recorded for delegated formats when no analyzer is configured.
pub const NO_LAYOUT_SERVICE: &str = "no layout-analysis service configured";

/// One uploaded file with its classification.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub classification: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Directory components of `filename` are dropped so a client cannot
    /// write outside its classification namespace.
    pub fn new(filename: &str, classification: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: bare_filename(filename).to_string(),
            classification: classification.into(),
            bytes,
        }
    }
}

/// Final path component of a client-supplied file name.
pub fn bare_filename(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
}

#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub chunk_size: usize,
    pub signed_url_ttl: Duration,
}

impl From<&Config> for IngestSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunking.chunk_size,
            signed_url_ttl: Duration::from_secs(config.storage.signed_url_ttl_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// A local extractor rejected a file; the batch was aborted.
    #[error("{source}")]
    Extraction {
        file: String,
        #[source]
        source: ExtractError,
    },
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

/// Phase-one result for one file.
enum Extracted {
    Text {
        file: String,
        classification: String,
        text: String,
    },
    Failed {
        file: String,
        classification: String,
        reason: String,
    },
}

/// Ingest a batch of files and trigger one indexer run.
pub async fn upload_batch(
    store: &dyn BlobStore,
    search: &dyn SearchService,
    layout: Option<&dyn LayoutAnalyzer>,
    files: Vec<UploadFile>,
    settings: IngestSettings,
) -> Result<UploadReport, IngestError> {
    let mut extracted = Vec::with_capacity(files.len());
    for file in files {
        extracted.push(extract_file(store, layout, file, settings).await?);
    }

    let extracted_at = Utc::now().to_rfc3339();
    let mut outcomes = Vec::with_capacity(extracted.len());
    for item in extracted {
        let outcome = match item {
            Extracted::Text {
                file,
                classification,
                text,
            } => {
                let parts =
                    store_document(store, &classification, &file, &text, settings, &extracted_at)
                        .await?;
                tracing::info!(
                    file = %file,
                    classification = %classification,
                    parts,
                    "stored document"
                );
                FileOutcome::Stored {
                    file,
                    classification,
                    parts,
                }
            }
            Extracted::Failed {
                file,
                classification,
                reason,
            } => FileOutcome::Failed {
                file,
                classification,
                reason,
            },
        };
        outcomes.push(outcome);
    }

    let indexer = search.run_indexer().await;
    Ok(UploadReport::from_outcomes(outcomes, indexer))
}

async fn extract_file(
    store: &dyn BlobStore,
    layout: Option<&dyn LayoutAnalyzer>,
    file: UploadFile,
    settings: IngestSettings,
) -> Result<Extracted, IngestError> {
    let kind = FileKind::from_filename(&file.filename);
    let UploadFile {
        filename,
        classification,
        bytes,
    } = file;

    if kind.has_local_extractor() {
        return match run_local(bytes, kind).await? {
            Ok(text) => Ok(Extracted::Text {
                file: filename,
                classification,
                text,
            }),
            Err(source) => {
                tracing::warn!(
                    file = %filename,
                    error = %source,
                    "extraction failed, aborting batch"
                );
                Err(IngestError::Extraction {
                    file: filename,
                    source,
                })
            }
        };
    }

    match layout {
        Some(analyzer) => {
            let result = analyze_staged(
                store,
                analyzer,
                &classification,
                &filename,
                kind,
                bytes,
                settings,
            )
            .await;
            Ok(match result {
                Ok(text) => Extracted::Text {
                    file: filename,
                    classification,
                    text,
                },
                Err(e) => {
                    tracing::warn!(file = %filename, error = %e, "layout analysis failed");
                    Extracted::Failed {
                        file: filename,
                        classification,
                        reason: format!("{:#}", e),
                    }
                }
            })
        }
        None if kind == FileKind::Pdf => Ok(match run_local(bytes, kind).await? {
            Ok(text) => Extracted::Text {
                file: filename,
                classification,
                text,
            },
            Err(e) => {
                tracing::warn!(file = %filename, error = %e, "local PDF extraction failed");
                Extracted::Failed {
                    file: filename,
                    classification,
                    reason: e.to_string(),
                }
            }
        }),
        None => {
            tracing::warn!(file = %filename, "no layout analyzer for delegated format");
            Ok(Extracted::Failed {
                file: filename,
                classification,
                reason: NO_LAYOUT_SERVICE.to_string(),
            })
        }
    }
}

/// Run an in-process extractor on the blocking pool.
async fn run_local(
    bytes: Vec<u8>,
    kind: FileKind,
) -> anyhow::Result<Result<String, ExtractError>> {
    tokio::task::spawn_blocking(move || extract_local(&bytes, kind))
        .await
        .context("extraction task panicked")
}

/// Stage the original, analyze it by URL, and always remove the staging object.
async fn analyze_staged(
    store: &dyn BlobStore,
    analyzer: &dyn LayoutAnalyzer,
    classification: &str,
    filename: &str,
    kind: FileKind,
    bytes: Vec<u8>,
    settings: IngestSettings,
) -> anyhow::Result<String> {
    let staging = staging_object_name(classification, filename);
    let content_type = match kind {
        FileKind::Pdf => "application/pdf",
        _ => "application/octet-stream",
    };
    let mut metadata = Metadata::new();
    metadata.insert("classification".to_string(), classification.to_string());
    store
        .put(&staging, bytes, content_type, &metadata)
        .await
        .with_context(|| format!("failed to stage {}", filename))?;

    let result = match store.signed_read_url(&staging, settings.signed_url_ttl) {
        Ok(url) => analyzer.analyze_url(&url).await,
        Err(e) => Err(e),
    };

    if let Err(e) = store.delete(&staging).await {
        tracing::warn!(object = %staging, error = %e, "failed to remove staging object");
    }
    result
}

fn chunk_metadata(
    classification: &str,
    chunk: &ChunkObject,
    parts: usize,
    extracted_at: &str,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("classification".to_string(), classification.to_string());
    metadata.insert("part".to_string(), chunk.part.to_string());
    metadata.insert("parts".to_string(), parts.to_string());
    metadata.insert("extracted_at".to_string(), extracted_at.to_string());
    metadata.insert("content_sha256".to_string(), chunk.hash.clone());
    metadata
}

/// Write all chunks of one document and remove stale higher-numbered parts.
/// Returns the number of parts written.
async fn store_document(
    store: &dyn BlobStore,
    classification: &str,
    filename: &str,
    text: &str,
    settings: IngestSettings,
    extracted_at: &str,
) -> anyhow::Result<usize> {
    let chunks = chunk_document(classification, filename, text, settings.chunk_size);
    let parts = chunks.len();

    for chunk in &chunks {
        let metadata = chunk_metadata(classification, chunk, parts, extracted_at);
        store
            .put(
                &chunk.name,
                chunk.text.as_bytes().to_vec(),
                CHUNK_CONTENT_TYPE,
                &metadata,
            )
            .await
            .with_context(|| format!("failed to store {}", chunk.name))?;
    }

    remove_stale_parts(store, classification, filename, parts).await?;
    Ok(parts)
}

async fn remove_stale_parts(
    store: &dyn BlobStore,
    classification: &str,
    filename: &str,
    parts: usize,
) -> anyhow::Result<()> {
    let prefix = chunk_prefix(classification, filename);
    for obj in store.list(Some(&prefix)).await? {
        let (_, doc_name) = split_object_name(&obj.name);
        let stale = matches!(
            parse_part_name(doc_name),
            Some((base, part)) if base == filename && part > parts
        );
        if stale {
            store.delete(&obj.name).await?;
            tracing::info!(object = %obj.name, "removed stale part");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndexerRun;
    use crate::store::memory::MemoryBlobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSearch {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl SearchService for CountingSearch {
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
        ) -> anyhow::Result<Vec<crate::search::SearchHit>> {
            Ok(Vec::new())
        }

        async fn run_indexer(&self) -> IndexerRun {
            self.runs.fetch_add(1, Ordering::SeqCst);
            IndexerRun::triggered()
        }
    }

    struct FailingLayout;

    #[async_trait]
    impl LayoutAnalyzer for FailingLayout {
        async fn analyze_url(&self, _url: &str) -> anyhow::Result<String> {
            anyhow::bail!("model rejected document")
        }
    }

    const SETTINGS: IngestSettings = IngestSettings {
        chunk_size: 4,
        signed_url_ttl: Duration::from_secs(60),
    };

    #[test]
    fn path_components_are_dropped() {
        assert_eq!(bare_filename("../../etc/passwd"), "passwd");
        assert_eq!(bare_filename("C:\\docs\\leave.txt"), "leave.txt");
        assert_eq!(bare_filename("plain.txt"), "plain.txt");
        assert_eq!(UploadFile::new("a/b.txt", "HR", vec![]).filename, "b.txt");
    }

    #[tokio::test]
    async fn text_file_is_chunked_with_metadata() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        let report = upload_batch(
            &store,
            &search,
            None,
            vec![UploadFile::new("leave.txt", "HR", b"abcdefghij".to_vec())],
            SETTINGS,
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, vec!["leave.txt"]);
        assert_eq!(report.files[0].parts, 3);
        assert_eq!(
            store.names(),
            vec!["HR/leave.txt_part1.txt", "HR/leave.txt_part2.txt", "HR/leave.txt_part3.txt"]
        );
        let last = store.get("HR/leave.txt_part3.txt").unwrap();
        assert_eq!(last.body, b"ij");
        assert_eq!(last.content_type, CHUNK_CONTENT_TYPE);
        assert_eq!(last.metadata["classification"], "HR");
        assert_eq!(last.metadata["part"], "3");
        assert_eq!(last.metadata["parts"], "3");
        assert_eq!(last.metadata["content_sha256"].len(), 64);
        assert_eq!(search.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shorter_reupload_removes_stale_parts() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        store
            .put("HR/leave.txt_part9.txt", b"old".to_vec(), "text/plain", &Metadata::new())
            .await
            .unwrap();
        store
            .put("HR/leave.txt_partial.txt", b"keep".to_vec(), "text/plain", &Metadata::new())
            .await
            .unwrap();

        upload_batch(
            &store,
            &search,
            None,
            vec![UploadFile::new("leave.txt", "HR", b"abc".to_vec())],
            SETTINGS,
        )
        .await
        .unwrap();

        assert_eq!(
            store.names(),
            vec!["HR/leave.txt_part1.txt", "HR/leave.txt_partial.txt"]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_aborts_batch_without_writes() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        let err = upload_batch(
            &store,
            &search,
            None,
            vec![
                UploadFile::new("good.txt", "HR", b"fine".to_vec()),
                UploadFile::new("bad.txt", "HR", vec![0xff, 0xfe]),
            ],
            SETTINGS,
        )
        .await
        .unwrap_err();

        match err {
            IngestError::Extraction { file, .. } => assert_eq!(file, "bad.txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.names().is_empty());
        assert_eq!(search.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn layout_failure_is_reported_and_staging_removed() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        let report = upload_batch(
            &store,
            &search,
            Some(&FailingLayout),
            vec![
                UploadFile::new("scan.tiff", "Legal", b"II*\0".to_vec()),
                UploadFile::new("notes.md", "Legal", b"hi".to_vec()),
            ],
            SETTINGS,
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, vec!["notes.md"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file, "scan.tiff");
        assert!(report.failed[0].reason.contains("model rejected document"));
        assert_eq!(store.names(), vec!["Legal/notes.md_part1.txt"]);
    }

    #[tokio::test]
    async fn delegated_format_without_analyzer_fails_file() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        let report = upload_batch(
            &store,
            &search,
            None,
            vec![UploadFile::new("scan.png", "Legal", vec![1, 2, 3])],
            SETTINGS,
        )
        .await
        .unwrap();

        assert!(report.uploaded.is_empty());
        assert_eq!(report.failed[0].reason, NO_LAYOUT_SERVICE);
        assert_eq!(search.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_pdf_without_analyzer_fails_only_that_file() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        let report = upload_batch(
            &store,
            &search,
            None,
            vec![UploadFile::new("broken.pdf", "Legal", b"not a pdf".to_vec())],
            SETTINGS,
        )
        .await
        .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.starts_with("Failed to process PDF"));
        assert!(store.names().is_empty());
    }

    #[tokio::test]
    async fn empty_text_counts_as_uploaded_with_no_parts() {
        let store = MemoryBlobStore::new();
        let search = CountingSearch::default();
        store
            .put("HR/empty.txt_part1.txt", b"old".to_vec(), "text/plain", &Metadata::new())
            .await
            .unwrap();

        let report = upload_batch(
            &store,
            &search,
            None,
            vec![UploadFile::new("empty.txt", "HR", Vec::new())],
            SETTINGS,
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, vec!["empty.txt"]);
        assert_eq!(report.files[0].parts, 0);
        assert!(store.names().is_empty());
    }
}
