//! In-memory [`BlobStore`] implementation for testing and local runs.
//!
//! Objects live in a `BTreeMap` behind `std::sync::RwLock`, so listings come
//! back in name order just like the real service.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::models::StoredObject;

use super::{BlobStore, Metadata};

/// A stored object's body and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: Metadata,
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a copy of one object.
    pub fn get(&self, name: &str) -> Option<MemoryObject> {
        self.read().get(name).cloned()
    }

    /// All object names in order.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, MemoryObject>> {
        // Every write is a single map operation, so a poisoned lock still
        // guards a consistent map.
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, MemoryObject>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>> {
        let prefix = prefix.unwrap_or("");
        Ok(self
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| StoredObject { name: name.clone() })
            .collect())
    }

    async fn put(
        &self,
        name: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        self.write().insert(
            name.to_string(),
            MemoryObject {
                body,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.write().remove(name);
        Ok(())
    }

    fn signed_read_url(&self, name: &str, ttl: Duration) -> Result<String> {
        let expiry = Utc::now() + chrono::Duration::from_std(ttl)?;
        Ok(format!(
            "memory:///{}?se={}",
            name,
            expiry.format("%Y-%m-%dT%H:%M:%SZ")
        ))
    }
}
