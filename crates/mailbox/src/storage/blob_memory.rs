//! In-process blob storage for development

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Result, anyhow};

use super::blob::{BlobKey, BlobStore, PresignedUrl, StoredBlob, expiry};

/// Blob store that keeps payloads in memory
///
/// Needs no object-storage credentials. Instead of signed URLs it hands out
/// the API's own same-origin endpoints, which stream through the service.
pub struct InMemoryBlobStore {
    base_url: String,
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl InMemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("blob store lock poisoned")
}

impl BlobStore for InMemoryBlobStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    fn put(&self, key: &str, content_type: &str, data: &[u8]) -> Result<()> {
        self.blobs.write().map_err(poisoned)?.insert(
            key.to_string(),
            StoredBlob {
                content_type: content_type.to_string(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        Ok(self.blobs.read().map_err(poisoned)?.get(key).cloned())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().map_err(poisoned)?.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn presigned_download_url(
        &self,
        key: &str,
        _filename: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl> {
        let key: BlobKey = key.parse().map_err(|e: String| anyhow!(e))?;
        Ok(PresignedUrl {
            url: format!("{}/attachments/{}/download", self.base_url, key.attachment_id),
            method: "GET",
            expires_at: expiry(ttl)?,
        })
    }

    fn presigned_upload_url(
        &self,
        _key: &str,
        _content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl> {
        Ok(PresignedUrl {
            url: format!("{}/attachments/upload", self.base_url),
            method: "POST",
            expires_at: expiry(ttl)?,
        })
    }
}
