//! Blob storage abstraction.
//!
//! The [`BlobStore`] trait covers the object operations the ingestion and
//! document endpoints need. Objects are addressed by their full name
//! (`{classification}/{name}`, see [`crate::naming`]).
//!
//! Implementations must be `Send + Sync` so a single handle can be shared
//! across request handlers.
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`azure::AzureBlobStore`] | Azure Blob Storage over REST with Shared Key signing |
//! | [`memory::MemoryBlobStore`] | In-process map for tests and local runs |

pub mod azure;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::StoredObject;

/// User metadata attached to an object.
pub type Metadata = BTreeMap<String, String>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List objects in name order, optionally restricted to a name prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>>;

    /// Create or overwrite an object.
    async fn put(
        &self,
        name: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// A URL granting anonymous read access to one object until `ttl` elapses.
    fn signed_read_url(&self, name: &str, ttl: Duration) -> Result<String>;
}
