//! Blob storage trait for attachment payloads

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::presign::UrlSigner;
use crate::models::{AttachmentId, TenantId};

const KEY_PREFIX: &str = "attachments";

/// Object key for an attachment payload: `attachments/{tenantId}/{attachmentId}{ext}`
///
/// The key never embeds the parent email or draft, so reparenting an
/// attachment never moves its blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub tenant_id: TenantId,
    pub attachment_id: AttachmentId,
    /// Lowercased extension including the dot, or empty
    pub extension: String,
}

impl BlobKey {
    /// Create the key for an attachment, taking the extension from its filename
    pub fn attachment(tenant_id: TenantId, attachment_id: AttachmentId, filename: &str) -> Self {
        Self {
            tenant_id,
            attachment_id,
            extension: extension_of(filename),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}{}",
            KEY_PREFIX, self.tenant_id, self.attachment_id, self.extension
        )
    }
}

impl FromStr for BlobKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let (Some(KEY_PREFIX), Some(tenant), Some(file)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("'{}' is not an attachment key", s));
        };

        let (id, extension) = match file.find('.') {
            Some(dot) => (&file[..dot], file[dot..].to_string()),
            None => (file, String::new()),
        };

        Ok(Self {
            tenant_id: tenant.parse().map_err(|_| format!("bad tenant in key '{}'", s))?,
            attachment_id: id.parse().map_err(|_| format!("bad attachment id in key '{}'", s))?,
            extension,
        })
    }
}

/// `.pdf` for `Quote.PDF`; empty when there is no usable extension
fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

/// Blob payload with the content type it was stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A time-limited URL granting access to one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    /// HTTP method the URL is valid for
    pub method: &'static str,
    pub expires_at: DateTime<Utc>,
}

/// Trait for blob storage operations
///
/// Implementations handle compression internally. The strategy is chosen
/// once at startup and injected into the services that need it.
pub trait BlobStore: Send + Sync {
    /// Bucket name recorded on attachment metadata
    fn bucket(&self) -> &str;

    /// Store blob content, replacing any previous object under `key`
    fn put(&self, key: &str, content_type: &str, data: &[u8]) -> Result<()>;

    /// Retrieve blob content
    ///
    /// Returns None if the blob doesn't exist.
    fn get(&self, key: &str) -> Result<Option<StoredBlob>>;

    /// Check if a blob exists
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a blob; deleting a missing blob is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// URL from which the object can be downloaded without credentials
    fn presigned_download_url(&self, key: &str, filename: &str, ttl: Duration)
    -> Result<PresignedUrl>;

    /// URL to which the object can be uploaded without credentials
    fn presigned_upload_url(&self, key: &str, content_type: &str, ttl: Duration)
    -> Result<PresignedUrl>;

    /// Signer used to verify requests against `/blobs/{key}`, if this store issues signed URLs
    fn url_signer(&self) -> Option<&UrlSigner> {
        None
    }
}

pub(crate) fn expiry(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)?;
    Ok(Utc::now() + ttl)
}
