//! Document listing and deletion over the blob store.
//!
//! Documents are not stored as records of their own: they are recovered by
//! listing chunk objects and collapsing `{name}_part{N}.txt` names to their
//! base name.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::DeleteMatch;
use crate::models::{DeleteReport, DocumentEntry};
use crate::naming::{base_document_name, matches_for_deletion, split_object_name};
use crate::search::SearchService;
use crate::store::BlobStore;

/// Distinct base documents in name order.
///
/// If the same base name appears under several classifications, the one seen
/// last in listing order is reported.
pub async fn list_documents(store: &dyn BlobStore) -> Result<Vec<DocumentEntry>> {
    let objects = store.list(None).await?;

    let mut documents: BTreeMap<String, String> = BTreeMap::new();
    for obj in &objects {
        let (classification, doc_name) = split_object_name(&obj.name);
        documents.insert(
            base_document_name(doc_name).to_string(),
            classification.to_string(),
        );
    }

    Ok(documents
        .into_iter()
        .map(|(document, classification)| DocumentEntry {
            document,
            classification,
        })
        .collect())
}

/// Delete every object matching one of `doc_names`, returning the deleted
/// object names in listing order. Each object is deleted at most once.
pub async fn delete_documents(
    store: &dyn BlobStore,
    doc_names: &[String],
    mode: DeleteMatch,
) -> Result<Vec<String>> {
    let requested: BTreeSet<&str> = doc_names.iter().map(String::as_str).collect();
    let objects = store.list(None).await?;

    let mut deleted = Vec::new();
    for obj in objects {
        let (_, doc_name) = split_object_name(&obj.name);
        if requested
            .iter()
            .any(|name| matches_for_deletion(doc_name, name, mode))
        {
            store.delete(&obj.name).await?;
            deleted.push(obj.name);
        }
    }

    tracing::info!(
        requested = requested.len(),
        deleted = deleted.len(),
        ?mode,
        "deleted documents"
    );
    Ok(deleted)
}

/// Delete matching objects, then trigger one indexer run.
pub async fn delete_and_reindex(
    store: &dyn BlobStore,
    search: &dyn SearchService,
    doc_names: &[String],
    mode: DeleteMatch,
) -> Result<DeleteReport> {
    let deleted = delete_documents(store, doc_names, mode).await?;
    let indexer = search.run_indexer().await;
    Ok(DeleteReport { deleted, indexer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBlobStore;
    use crate::store::Metadata;

    async fn seed(store: &MemoryBlobStore, names: &[&str]) {
        for name in names {
            store
                .put(name, b"x".to_vec(), "text/plain", &Metadata::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn parts_collapse_to_one_document() {
        let store = MemoryBlobStore::new();
        seed(
            &store,
            &["Legal/foo.pdf_part1.txt", "Legal/foo.pdf_part2.txt", "HR/leave.docx_part1.txt"],
        )
        .await;

        let docs = list_documents(&store).await.unwrap();
        assert_eq!(
            docs,
            vec![
                DocumentEntry {
                    document: "foo.pdf".into(),
                    classification: "Legal".into()
                },
                DocumentEntry {
                    document: "leave.docx".into(),
                    classification: "HR".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn last_seen_classification_wins() {
        let store = MemoryBlobStore::new();
        seed(&store, &["HR/a.txt_part1.txt", "Legal/a.txt_part1.txt", "loose.txt"]).await;

        let docs = list_documents(&store).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].document, "a.txt");
        assert_eq!(docs[0].classification, "Legal");
        assert_eq!(docs[1].document, "loose.txt");
        assert_eq!(docs[1].classification, "unknown");
    }

    #[tokio::test]
    async fn exact_deletion_spares_similar_names() {
        let store = MemoryBlobStore::new();
        seed(
            &store,
            &["HR/foo_part1.txt", "HR/foo_part2.txt", "HR/foobar_part1.txt"],
        )
        .await;

        let deleted = delete_documents(&store, &["foo".to_string()], DeleteMatch::Exact)
            .await
            .unwrap();
        assert_eq!(deleted, vec!["HR/foo_part1.txt", "HR/foo_part2.txt"]);
        assert_eq!(store.names(), vec!["HR/foobar_part1.txt"]);
    }

    #[tokio::test]
    async fn prefix_deletion_is_broad() {
        let store = MemoryBlobStore::new();
        seed(&store, &["HR/foo_part1.txt", "Legal/foobar_part1.txt"]).await;

        let deleted = delete_documents(&store, &["foo".to_string()], DeleteMatch::Prefix)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(store.names().is_empty());
    }

    #[tokio::test]
    async fn overlapping_requests_delete_once() {
        let store = MemoryBlobStore::new();
        seed(&store, &["HR/foo_part1.txt"]).await;

        let deleted = delete_documents(
            &store,
            &["foo".to_string(), "fo".to_string(), "foo".to_string()],
            DeleteMatch::Prefix,
        )
        .await
        .unwrap();
        assert_eq!(deleted, vec!["HR/foo_part1.txt"]);
    }
}
