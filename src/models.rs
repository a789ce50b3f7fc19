//! Core data models used throughout docrag.
//!
//! These types describe the stored objects, listed documents, chat turns and
//! batch results that flow between the endpoint layer and the services.

use serde::{Deserialize, Serialize};

/// An object as reported by a blob listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Full object name, e.g. `"Legal/foo.pdf_part1.txt"`.
    pub name: String,
}

/// A logical document derived from its chunk objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentEntry {
    #[serde(rename = "Document")]
    pub document: String,
    #[serde(rename = "Classification")]
    pub classification: String,
}

/// A single chat turn. Only `role == "user"` entries are consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Result of asking the search service to run its indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerRun {
    pub status: String,
    pub message: String,
}

impl IndexerRun {
    pub fn triggered() -> Self {
        Self {
            status: "success".to_string(),
            message: "Indexer run triggered.".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Per-file result of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Stored {
        file: String,
        classification: String,
        parts: usize,
    },
    Failed {
        file: String,
        classification: String,
        reason: String,
    },
}

/// Failure entry in an [`UploadReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub classification: String,
    pub reason: String,
}

/// Stored file entry in an [`UploadReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub file: String,
    pub classification: String,
    pub parts: usize,
}

/// Response body for an upload batch.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    /// Names of files whose chunks were stored, in upload order.
    pub uploaded: Vec<String>,
    pub failed: Vec<FailedFile>,
    pub files: Vec<StoredFile>,
    pub indexer: IndexerRun,
}

impl UploadReport {
    pub fn from_outcomes(outcomes: Vec<FileOutcome>, indexer: IndexerRun) -> Self {
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        let mut files = Vec::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Stored {
                    file,
                    classification,
                    parts,
                } => {
                    uploaded.push(file.clone());
                    files.push(StoredFile {
                        file,
                        classification,
                        parts,
                    });
                }
                FileOutcome::Failed {
                    file,
                    classification,
                    reason,
                } => failed.push(FailedFile {
                    file,
                    classification,
                    reason,
                }),
            }
        }
        Self {
            uploaded,
            failed,
            files,
            indexer,
        }
    }
}

/// Response body for a delete request.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub indexer: IndexerRun,
}

/// Response body for `GET /documents`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentEntry>,
}

/// Response body for a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_entry_uses_capitalized_keys() {
        let entry = DocumentEntry {
            document: "foo.pdf".to_string(),
            classification: "Legal".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["Document"], "foo.pdf");
        assert_eq!(json["Classification"], "Legal");
    }

    #[test]
    fn chat_message_tolerates_missing_content_and_extra_fields() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","id":7}"#).unwrap();
        assert_eq!(msg.role, "assistant");
        assert!(msg.content.is_empty());
    }

    #[test]
    fn report_splits_outcomes_in_order() {
        let report = UploadReport::from_outcomes(
            vec![
                FileOutcome::Stored {
                    file: "a.txt".into(),
                    classification: "HR".into(),
                    parts: 2,
                },
                FileOutcome::Failed {
                    file: "scan.pdf".into(),
                    classification: "HR".into(),
                    reason: "layout analysis failed".into(),
                },
                FileOutcome::Stored {
                    file: "b.docx".into(),
                    classification: "Legal".into(),
                    parts: 1,
                },
            ],
            IndexerRun::triggered(),
        );
        assert_eq!(report.uploaded, vec!["a.txt", "b.docx"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file, "scan.pdf");
        assert_eq!(report.files[0].parts, 2);
        assert!(report.indexer.is_success());
    }
}
