//! Attachment service: uploads, metadata, downloads and presigned URLs
//!
//! Metadata lives in the mailbox store, payloads in the blob store. Blob
//! failures surface as `StorageUnavailable`; operations that only touch
//! metadata keep working while the blob store is down.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;

use crate::error::{MailboxError, Result};
use crate::models::{
    Attachment, AttachmentId, AttachmentParent, DraftId, EmailId, MailboxScope, TenantId,
};
use crate::storage::{BlobKey, BlobStore, MailboxStore, PresignedUrl, StoredBlob, UrlSigner};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_FILENAME_CHARS: usize = 255;

/// A new upload: what the client sends with a multipart request
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    /// Draft to attach to; the upload is orphaned when absent
    pub draft_id: Option<DraftId>,
}

/// Response to a presigned-upload request
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    /// Metadata row reserved for the object, when the store uploads straight to a key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub upload: PresignedUrl,
}

pub struct AttachmentService {
    store: Arc<dyn MailboxStore>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: u64,
    presign_ttl: Duration,
}

impl AttachmentService {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        blobs: Arc<dyn BlobStore>,
        max_upload_bytes: u64,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            max_upload_bytes,
            presign_ttl,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Reject a declared size above the upload cap before reading the body
    pub fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_upload_bytes {
            return Err(MailboxError::validation(
                "file",
                format!("file exceeds the {} byte upload limit", self.max_upload_bytes),
            ));
        }
        Ok(())
    }

    /// Store an uploaded file and record its metadata
    ///
    /// The payload is written first. If the metadata insert then fails the
    /// payload is removed again.
    pub fn upload(&self, scope: MailboxScope, upload: Upload) -> Result<Attachment> {
        self.check_size(upload.data.len() as u64)?;
        let filename = clean_filename(&upload.filename)?;
        let content_type = clean_content_type(upload.content_type.as_deref());

        let parent = match upload.draft_id {
            Some(draft_id) => {
                if self.store.get_draft(scope, draft_id)?.is_none() {
                    return Err(MailboxError::not_found(format!("draft {}", draft_id)));
                }
                AttachmentParent::Draft(draft_id)
            }
            None => AttachmentParent::Orphaned,
        };

        let id = AttachmentId::new();
        let key = BlobKey::attachment(scope.tenant_id, id, &filename).to_string();

        self.blobs
            .put(&key, &content_type, &upload.data)
            .map_err(|e| {
                error!("[BLOB] Failed to store {} for {}: {:#}", key, scope, e);
                MailboxError::storage_unavailable(e)
            })?;

        let attachment = Attachment {
            id,
            tenant_id: scope.tenant_id,
            user_id: scope.user_id,
            parent,
            filename,
            content_type,
            size_bytes: upload.data.len() as u64,
            blob_key: key,
            blob_bucket: self.blobs.bucket().to_string(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_attachment(&attachment) {
            if let Err(cleanup) = self.blobs.delete(&attachment.blob_key) {
                warn!(
                    "[BLOB] Failed to remove unrecorded upload {}: {:#}",
                    attachment.blob_key, cleanup
                );
            }
            return Err(e);
        }

        info!(
            "[BLOB] Uploaded attachment {} ({} bytes) for {}",
            attachment.id, attachment.size_bytes, scope
        );
        Ok(attachment)
    }

    pub fn get(&self, scope: MailboxScope, id: AttachmentId) -> Result<Attachment> {
        self.store
            .get_attachment(scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("attachment {}", id)))
    }

    pub fn list_for_email(&self, scope: MailboxScope, email_id: EmailId) -> Result<Vec<Attachment>> {
        self.store.list_email_attachments(scope, email_id)
    }

    /// Metadata plus payload for streaming a download through the service
    pub fn download(&self, scope: MailboxScope, id: AttachmentId) -> Result<(Attachment, StoredBlob)> {
        let attachment = self.get(scope, id)?;
        let blob = self
            .blobs
            .get(&attachment.blob_key)
            .map_err(MailboxError::storage_unavailable)?
            .ok_or_else(|| MailboxError::not_found(format!("payload of attachment {}", id)))?;
        Ok((attachment, blob))
    }

    /// Delete metadata, then the payload
    ///
    /// A payload that cannot be removed is logged; the metadata stays deleted.
    pub fn delete(&self, scope: MailboxScope, id: AttachmentId) -> Result<Attachment> {
        let removed = self.store.delete_attachment(scope, id)?;
        if let Err(e) = self.blobs.delete(&removed.blob_key) {
            error!(
                "[BLOB] Failed to delete blob {} for {}: {:#}",
                removed.blob_key, scope, e
            );
        }
        Ok(removed)
    }

    pub fn download_url(&self, scope: MailboxScope, id: AttachmentId) -> Result<PresignedUrl> {
        let attachment = self.get(scope, id)?;
        self.blobs
            .presigned_download_url(&attachment.blob_key, &attachment.filename, self.presign_ttl)
            .map_err(MailboxError::storage_unavailable)
    }

    /// Issue an upload URL for a file the client sends directly
    ///
    /// When the store signs URLs for a specific key, the metadata row is
    /// reserved now with the declared size. Otherwise the URL points at the
    /// multipart upload endpoint, which records metadata itself.
    pub fn upload_url(
        &self,
        scope: MailboxScope,
        filename: &str,
        content_type: Option<&str>,
        size_bytes: u64,
        draft_id: Option<DraftId>,
    ) -> Result<UploadTicket> {
        self.check_size(size_bytes)?;
        let filename = clean_filename(filename)?;
        let content_type = clean_content_type(content_type);

        let id = AttachmentId::new();
        let key = BlobKey::attachment(scope.tenant_id, id, &filename).to_string();
        let upload = self
            .blobs
            .presigned_upload_url(&key, &content_type, self.presign_ttl)
            .map_err(MailboxError::storage_unavailable)?;

        if self.blobs.url_signer().is_none() {
            return Ok(UploadTicket {
                attachment: None,
                upload,
            });
        }

        let attachment = Attachment {
            id,
            tenant_id: scope.tenant_id,
            user_id: scope.user_id,
            parent: draft_id.map_or(AttachmentParent::Orphaned, AttachmentParent::Draft),
            filename,
            content_type,
            size_bytes,
            blob_key: key,
            blob_bucket: self.blobs.bucket().to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_attachment(&attachment)?;

        Ok(UploadTicket {
            attachment: Some(attachment),
            upload,
        })
    }

    /// Verifier for `/blobs/{key}` requests, present in production mode
    pub fn blob_signer(&self) -> Option<&UrlSigner> {
        self.blobs.url_signer()
    }

    /// Payload behind a verified signed download
    pub fn read_blob(&self, key: &str) -> Result<StoredBlob> {
        self.blobs
            .get(key)
            .map_err(MailboxError::storage_unavailable)?
            .ok_or_else(|| MailboxError::not_found(format!("blob {}", key)))
    }

    /// Store the body of a verified signed upload
    pub fn write_blob(&self, key: &str, content_type: Option<&str>, data: &[u8]) -> Result<()> {
        self.check_size(data.len() as u64)?;
        let key: BlobKey = key
            .parse()
            .map_err(|e: String| MailboxError::validation("key", e))?;
        self.blobs
            .put(&key.to_string(), &clean_content_type(content_type), data)
            .map_err(MailboxError::storage_unavailable)
    }

    /// Orphaned uploads older than `older_than`, for an external sweep
    pub fn list_orphaned(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>> {
        self.store.list_orphaned_attachments(tenant_id, older_than)
    }
}

/// Last path component, trimmed; clients sometimes send full local paths
fn clean_filename(raw: &str) -> Result<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(MailboxError::validation("filename", "filename is required"));
    }
    Ok(name.chars().take(MAX_FILENAME_CHARS).collect())
}

fn clean_content_type(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|ct| ct.contains('/') && !ct.contains(char::is_whitespace))
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DraftFields, UserId};
    use crate::storage::{FileBlobStore, InMemoryBlobStore, SqliteMailboxStore};

    /// Blob store whose every call fails, as if the backend were down
    struct DownBlobStore;

    impl BlobStore for DownBlobStore {
        fn bucket(&self) -> &str {
            "down"
        }
        fn put(&self, _: &str, _: &str, _: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        fn get(&self, _: &str) -> anyhow::Result<Option<StoredBlob>> {
            anyhow::bail!("connection refused")
        }
        fn exists(&self, _: &str) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
        fn delete(&self, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        fn presigned_download_url(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<PresignedUrl> {
            anyhow::bail!("connection refused")
        }
        fn presigned_upload_url(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<PresignedUrl> {
            anyhow::bail!("connection refused")
        }
    }

    fn service(blobs: Arc<dyn BlobStore>) -> (Arc<SqliteMailboxStore>, AttachmentService) {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let svc = AttachmentService::new(store.clone(), blobs, 1024, Duration::from_secs(900));
        (store, svc)
    }

    fn scope() -> MailboxScope {
        MailboxScope::new(TenantId::new(), UserId::new())
    }

    fn file(name: &str, data: &[u8]) -> Upload {
        Upload {
            filename: name.to_string(),
            content_type: Some("text/plain".to_string()),
            data: data.to_vec(),
            draft_id: None,
        }
    }

    #[test]
    fn test_upload_download_delete() {
        let blobs = Arc::new(InMemoryBlobStore::new("http://localhost"));
        let (_, svc) = service(blobs.clone());
        let scope = scope();

        let attachment = svc.upload(scope, file("C:\\Users\\rep\\notes.TXT", b"hello")).unwrap();
        assert_eq!(attachment.filename, "notes.TXT");
        assert!(attachment.parent.is_orphaned());
        assert!(attachment.blob_key.ends_with(".txt"));
        assert_eq!(attachment.blob_bucket, "memory");

        let (meta, blob) = svc.download(scope, attachment.id).unwrap();
        assert_eq!(meta.id, attachment.id);
        assert_eq!(blob.data, b"hello");
        assert_eq!(blob.content_type, "text/plain");

        svc.delete(scope, attachment.id).unwrap();
        assert!(blobs.is_empty());
        assert!(matches!(
            svc.get(scope, attachment.id),
            Err(MailboxError::NotFound { .. })
        ));
    }

    #[test]
    fn test_upload_limits() {
        let (_, svc) = service(Arc::new(InMemoryBlobStore::new("http://localhost")));
        let err = svc.upload(scope(), file("big.bin", &[0u8; 1025])).unwrap_err();
        assert!(matches!(err, MailboxError::Validation(_)));
        assert!(svc.upload(scope(), file("  ", b"x")).is_err());
    }

    #[test]
    fn test_upload_to_foreign_draft_is_not_found() {
        let blobs = Arc::new(InMemoryBlobStore::new("http://localhost"));
        let (store, svc) = service(blobs.clone());
        let owner = scope();
        let draft = store.create_draft(owner, &DraftFields::default()).unwrap();

        let mut upload = file("a.txt", b"x");
        upload.draft_id = Some(draft.id);
        let stranger = MailboxScope::new(owner.tenant_id, UserId::new());
        assert!(matches!(
            svc.upload(stranger, upload.clone()),
            Err(MailboxError::NotFound { .. })
        ));
        assert!(blobs.is_empty());

        let attachment = svc.upload(owner, upload).unwrap();
        assert_eq!(attachment.parent, AttachmentParent::Draft(draft.id));
    }

    #[test]
    fn test_blob_outage_keeps_metadata_operations() {
        let working = Arc::new(InMemoryBlobStore::new("http://localhost"));
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let scope = scope();
        let uploaded = AttachmentService::new(store.clone(), working, 1024, Duration::from_secs(60))
            .upload(scope, file("a.txt", b"x"))
            .unwrap();

        let down = AttachmentService::new(store, Arc::new(DownBlobStore), 1024, Duration::from_secs(60));
        assert!(matches!(
            down.upload(scope, file("b.txt", b"y")),
            Err(MailboxError::StorageUnavailable { .. })
        ));
        assert!(matches!(
            down.download(scope, uploaded.id),
            Err(MailboxError::StorageUnavailable { .. })
        ));
        assert_eq!(down.get(scope, uploaded.id).unwrap().id, uploaded.id);
        assert!(down.delete(scope, uploaded.id).is_ok());
    }

    #[test]
    fn test_signed_upload_reserves_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let signer = UrlSigner::new("0123456789abcdef", "https://mail.example.com").unwrap();
        let blobs = Arc::new(FileBlobStore::new(dir.path(), "attachments", signer).unwrap());
        let (_, svc) = service(blobs);
        let scope = scope();

        let ticket = svc
            .upload_url(scope, "photo.jpg", Some("image/jpeg"), 512, None)
            .unwrap();
        let attachment = ticket.attachment.unwrap();
        assert_eq!(ticket.upload.method, "PUT");
        assert!(ticket.upload.url.contains(&attachment.blob_key));
        assert_eq!(attachment.size_bytes, 512);

        svc.write_blob(&attachment.blob_key, Some("image/jpeg"), b"jpeg").unwrap();
        assert_eq!(svc.read_blob(&attachment.blob_key).unwrap().data, b"jpeg");
        assert!(svc.upload_url(scope, "huge.bin", None, 4096, None).is_err());
    }

    #[test]
    fn test_dev_upload_url_points_at_endpoint() {
        let (_, svc) = service(Arc::new(InMemoryBlobStore::new("http://localhost:8080")));
        let ticket = svc.upload_url(scope(), "a.pdf", None, 10, None).unwrap();
        assert!(ticket.attachment.is_none());
        assert_eq!(ticket.upload.url, "http://localhost:8080/attachments/upload");
        assert!(svc.blob_signer().is_none());
    }

    #[test]
    fn test_clean_content_type() {
        assert_eq!(clean_content_type(Some(" Image/PNG ")), "image/png");
        assert_eq!(clean_content_type(Some("garbage")), DEFAULT_CONTENT_TYPE);
        assert_eq!(clean_content_type(None), DEFAULT_CONTENT_TYPE);
    }
}
