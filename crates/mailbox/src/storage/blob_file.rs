//! File-based blob storage with zstd compression

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use sha2::{Digest, Sha256};

use super::blob::{BlobStore, PresignedUrl, StoredBlob, expiry};
use super::presign::UrlSigner;

/// File-based blob storage with zstd compression
///
/// Object keys are hashed so arbitrary keys never touch the path. Each object
/// is a compressed payload plus a sidecar holding its content type:
/// ```text
/// blobs/
///   3f/
///     3fa9...e1.zst      # payload
///     3fa9...e1.type     # "application/pdf"
///   c0/
///     c07b...42.zst
/// ```
///
/// Downloads and uploads happen through HMAC-signed `/blobs/{key}` URLs.
pub struct FileBlobStore {
    root: PathBuf,
    bucket: String,
    signer: UrlSigner,
    compression_level: i32,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>, bucket: impl Into<String>, signer: UrlSigner) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            bucket: bucket.into(),
            signer,
            compression_level: 3, // Good balance of speed vs compression
        })
    }

    /// Path of the payload for `key`, without extension
    fn object_stem(&self, key: &str) -> PathBuf {
        let digest = hex(&Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(digest)
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.object_stem(key).with_extension("zst")
    }

    fn type_path(&self, key: &str) -> PathBuf {
        self.object_stem(key).with_extension("type")
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Write atomically (write to temp, then rename)
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, data)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to move blob into {}", path.display()))?;
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, content_type: &str, data: &[u8]) -> Result<()> {
        let path = self.payload_path(key);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress blob")?;

        write_atomic(&self.type_path(key), content_type.as_bytes())?;
        write_atomic(&path, &compressed)?;

        debug!(
            "[BLOB] Stored {} ({} bytes, {} compressed)",
            key,
            data.len(),
            compressed.len()
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        let path = self.payload_path(key);

        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .context("Failed to decompress blob")?;

        let content_type = fs::read_to_string(self.type_path(key))
            .unwrap_or_else(|_| "application/octet-stream".to_string());

        Ok(Some(StoredBlob { content_type, data }))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.payload_path(key).exists())
    }

    fn delete(&self, key: &str) -> Result<()> {
        for path in [self.payload_path(key), self.type_path(key)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn presigned_download_url(
        &self,
        key: &str,
        _filename: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl> {
        self.signer.sign("GET", key, expiry(ttl)?)
    }

    fn presigned_upload_url(
        &self,
        key: &str,
        _content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl> {
        self.signer.sign("PUT", key, expiry(ttl)?)
    }

    fn url_signer(&self) -> Option<&UrlSigner> {
        Some(&self.signer)
    }
}
