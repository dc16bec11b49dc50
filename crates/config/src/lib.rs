//! Configuration file locations for the mailbox services
//!
//! Resolves the shared config directory (`~/.config/mailbox/`, overridable with
//! `MAILBOX_CONFIG_DIR`) and the data directory used for default database,
//! blob and search index paths (`~/.local/share/mailbox/`, overridable with
//! `MAILBOX_DATA_DIR`).

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name used under the platform config/data roots
const APP_DIR: &str = "mailbox";

/// Environment override for the config directory
pub const CONFIG_DIR_ENV: &str = "MAILBOX_CONFIG_DIR";

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "MAILBOX_DATA_DIR";

/// Get the mailbox config directory
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = env_dir(CONFIG_DIR_ENV) {
        return Some(dir);
    }
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Get the mailbox data directory (database, blobs, search index)
pub fn data_dir() -> Option<PathBuf> {
    if let Some(dir) = env_dir(DATA_DIR_ENV) {
        return Some(dir);
    }
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

fn env_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Get the path to a config file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Get the path to a file or directory within the data directory
pub fn data_path(name: &str) -> Option<PathBuf> {
    data_dir().map(|p| p.join(name))
}

/// Load and parse a JSON config file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Check if a config file exists in the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        port: u16,
    }

    #[test]
    fn test_config_path_ends_with_file() {
        let path = config_path("mailbox.json");
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("mailbox.json"));
    }

    #[test]
    fn test_data_path_ends_with_name() {
        let path = data_path("mailbox.sqlite");
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("mailbox.sqlite"));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, r#"{ "name": "mailboxd", "port": 8080 }"#).unwrap();

        let sample: Sample = load_json_file(&path).unwrap();
        assert_eq!(sample.name, "mailboxd");
        assert_eq!(sample.port, 8080);
    }

    #[test]
    fn test_load_json_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_json_file::<Sample>(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
