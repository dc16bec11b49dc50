//! HMAC-SHA256 signed URLs for the `/blobs/{key}` endpoints

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use super::blob::PresignedUrl;

type HmacSha256 = Hmac<Sha256>;

/// Why a signed request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signed URL has expired")]
    Expired,
    #[error("Signed URL signature is invalid")]
    Invalid,
}

/// Issues and verifies signed blob URLs
///
/// The signature covers the method, the object key and the expiry, so a
/// download URL cannot be replayed as an upload and the expiry cannot be
/// extended.
pub struct UrlSigner {
    keyed: HmacSha256,
    base_url: Url,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid base URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("Base URL '{}' cannot carry a path", base_url));
        }
        let keyed = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| anyhow!("Invalid signing secret: {}", e))?;
        Ok(Self { keyed, base_url })
    }

    fn mac(&self, method: &str, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    /// Build `{base}/blobs/{key}?expires=..&signature=..`
    pub fn sign(
        &self,
        method: &'static str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<PresignedUrl> {
        let expires = expires_at.timestamp();
        let signature = URL_SAFE_NO_PAD.encode(self.mac(method, key, expires).finalize().into_bytes());

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Base URL cannot carry a path"))?
            .pop_if_empty()
            .push("blobs")
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);

        Ok(PresignedUrl {
            url: url.to_string(),
            method,
            expires_at,
        })
    }

    /// Check a request's `expires` and `signature` query values
    pub fn verify(
        &self,
        method: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SignatureError> {
        if now.timestamp() > expires {
            return Err(SignatureError::Expired);
        }
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Invalid)?;
        self.mac(method, key, expires)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Invalid)
    }
}
