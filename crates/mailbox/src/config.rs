//! Configuration loading for the mailbox service
//!
//! Settings are resolved in this order:
//! 1. An explicit JSON file (`mailboxd --config PATH`)
//! 2. `mailbox.json` in the mailbox config directory
//! 3. Built-in defaults
//!
//! `MAILBOX_*` environment variables are then applied on top, field by field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Config filename in the mailbox config directory
pub const CONFIG_FILE: &str = "mailbox.json";

/// Hard cap for a single attachment upload
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_PRESIGN_TTL_SECS: u64 = 15 * 60;
const DEFAULT_MESSAGE_ID_DOMAIN: &str = "mailbox.local";
const DEFAULT_BUCKET: &str = "attachments";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub listen_addr: String,
    /// SQLite database file; `None` keeps the database in memory
    pub database_path: Option<PathBuf>,
    /// Search index directory; `None` keeps the index in memory
    pub search_index_path: Option<PathBuf>,
    pub blob: BlobConfig,
    pub presign_ttl_secs: u64,
    pub max_upload_bytes: u64,
    /// Right-hand side of generated Message-IDs
    pub message_id_domain: String,
    /// Outbound SMTP relay; sends are only logged when absent
    pub smtp: Option<SmtpConfig>,
}

/// Blob storage strategy, chosen once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BlobConfig {
    /// Compressed objects on disk behind HMAC-signed URLs
    Production {
        root: PathBuf,
        public_base_url: String,
        signing_secret: String,
        #[serde(default = "default_bucket")]
        bucket: String,
    },
    /// Payloads kept in process, served through same-origin endpoints
    Development { public_base_url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Plain connection without TLS, for local relays only
    #[serde(default)]
    pub insecure: bool,
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for BlobConfig {
    fn default() -> Self {
        BlobConfig::Development {
            public_base_url: format!("http://{}", DEFAULT_LISTEN_ADDR),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            database_path: config::data_path("mailbox.sqlite"),
            search_index_path: None,
            blob: BlobConfig::default(),
            presign_ttl_secs: DEFAULT_PRESIGN_TTL_SECS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            message_id_domain: DEFAULT_MESSAGE_ID_DOMAIN.to_string(),
            smtp: None,
        }
    }
}

impl MailboxConfig {
    /// Fully in-memory configuration for tests and local experiments
    pub fn in_memory() -> Self {
        Self {
            database_path: None,
            search_index_path: None,
            ..Self::default()
        }
    }

    /// Load configuration using the documented priority, then env overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg: Self = match explicit {
            Some(path) => config::load_json_file(path)?,
            None if config::config_exists(CONFIG_FILE) => config::load_json(CONFIG_FILE)?,
            None => Self::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json).context("Failed to parse mailbox config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }

    pub fn public_base_url(&self) -> &str {
        match &self.blob {
            BlobConfig::Production {
                public_base_url, ..
            }
            | BlobConfig::Development { public_base_url } => public_base_url,
        }
    }

    /// Apply `MAILBOX_*` overrides from a variable lookup
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("MAILBOX_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("MAILBOX_DATABASE_PATH") {
            self.database_path = (v != ":memory:").then(|| PathBuf::from(v));
        }
        if let Some(v) = get("MAILBOX_SEARCH_INDEX_PATH") {
            self.search_index_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MAILBOX_PRESIGN_TTL_SECS") {
            self.presign_ttl_secs = v
                .parse()
                .context("MAILBOX_PRESIGN_TTL_SECS must be a number of seconds")?;
        }
        if let Some(v) = get("MAILBOX_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = v
                .parse()
                .context("MAILBOX_MAX_UPLOAD_BYTES must be a number of bytes")?;
        }
        if let Some(v) = get("MAILBOX_MESSAGE_ID_DOMAIN") {
            self.message_id_domain = v;
        }

        let base_url = get("MAILBOX_PUBLIC_BASE_URL");
        match get("MAILBOX_BLOB_MODE").as_deref() {
            Some("production") => {
                let root = get("MAILBOX_BLOB_ROOT")
                    .map(PathBuf::from)
                    .or_else(|| config::data_path("blobs"))
                    .context("MAILBOX_BLOB_ROOT is required in production blob mode")?;
                let signing_secret = get("MAILBOX_BLOB_SIGNING_SECRET")
                    .context("MAILBOX_BLOB_SIGNING_SECRET is required in production blob mode")?;
                self.blob = BlobConfig::Production {
                    root,
                    public_base_url: base_url
                        .unwrap_or_else(|| self.public_base_url().to_string()),
                    signing_secret,
                    bucket: get("MAILBOX_BLOB_BUCKET").unwrap_or_else(default_bucket),
                };
            }
            Some("development") => {
                self.blob = BlobConfig::Development {
                    public_base_url: base_url
                        .unwrap_or_else(|| self.public_base_url().to_string()),
                };
            }
            Some(other) => bail!("Unknown MAILBOX_BLOB_MODE '{}'", other),
            None => {
                if let Some(url) = base_url {
                    match &mut self.blob {
                        BlobConfig::Production {
                            public_base_url, ..
                        }
                        | BlobConfig::Development { public_base_url } => *public_base_url = url,
                    }
                }
            }
        }

        if let Some(host) = get("MAILBOX_SMTP_HOST") {
            let port = match get("MAILBOX_SMTP_PORT") {
                Some(p) => p.parse().context("MAILBOX_SMTP_PORT must be a port number")?,
                None => default_smtp_port(),
            };
            self.smtp = Some(SmtpConfig {
                host,
                port,
                username: get("MAILBOX_SMTP_USERNAME"),
                password: get("MAILBOX_SMTP_PASSWORD"),
                insecure: get("MAILBOX_SMTP_INSECURE").is_some_and(|v| v == "1" || v == "true"),
            });
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(self.public_base_url()).with_context(|| {
            format!("Invalid public base URL '{}'", self.public_base_url())
        })?;

        if let BlobConfig::Production { signing_secret, .. } = &self.blob
            && signing_secret.len() < 16
        {
            bail!("Blob signing secret must be at least 16 bytes");
        }
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be positive");
        }
        if self.presign_ttl_secs == 0 {
            bail!("presign_ttl_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = MailboxConfig::default();
        assert_eq!(cfg.max_upload_bytes, 25 * 1024 * 1024);
        assert_eq!(cfg.presign_ttl(), Duration::from_secs(900));
        assert!(matches!(cfg.blob, BlobConfig::Development { .. }));
    }

    #[test]
    fn test_parse_production_json() {
        let json = r#"{
            "listen_addr": "0.0.0.0:9000",
            "blob": {
                "mode": "production",
                "root": "/var/lib/mailbox/blobs",
                "public_base_url": "https://mail.example.com",
                "signing_secret": "0123456789abcdef0123"
            }
        }"#;

        let cfg = MailboxConfig::from_json(json).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        match cfg.blob {
            BlobConfig::Production { bucket, .. } => assert_eq!(bucket, "attachments"),
            other => panic!("unexpected blob config {:?}", other),
        }
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let json = r#"{
            "blob": {
                "mode": "production",
                "root": "/tmp/blobs",
                "public_base_url": "https://mail.example.com",
                "signing_secret": "short"
            }
        }"#;
        assert!(MailboxConfig::from_json(json).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = MailboxConfig::default();
        cfg.apply_env(env(&[
            ("MAILBOX_LISTEN_ADDR", "0.0.0.0:1234"),
            ("MAILBOX_DATABASE_PATH", ":memory:"),
            ("MAILBOX_BLOB_MODE", "production"),
            ("MAILBOX_BLOB_ROOT", "/srv/blobs"),
            ("MAILBOX_BLOB_SIGNING_SECRET", "a-very-long-signing-secret"),
            ("MAILBOX_PUBLIC_BASE_URL", "https://mail.example.com"),
            ("MAILBOX_SMTP_HOST", "smtp.example.com"),
        ]))
        .unwrap();

        assert_eq!(cfg.listen_addr, "0.0.0.0:1234");
        assert_eq!(cfg.database_path, None);
        assert_eq!(cfg.public_base_url(), "https://mail.example.com");
        assert_eq!(cfg.smtp.as_ref().map(|s| s.port), Some(587));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_rejects_unknown_blob_mode() {
        let mut cfg = MailboxConfig::default();
        assert!(cfg.apply_env(env(&[("MAILBOX_BLOB_MODE", "s3")])).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailbox.json");
        std::fs::write(&path, r#"{ "message_id_domain": "dealer.example" }"#).unwrap();

        let cfg = MailboxConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.message_id_domain, "dealer.example");
    }
}
