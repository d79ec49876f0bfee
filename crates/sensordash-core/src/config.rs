//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the API URL, last used username, where the session is kept and how the
//! dispatcher treats concurrent refreshes.
//!
//! Configuration is stored at `~/.config/sensordash/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::RefreshPolicy;
use crate::auth::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sensordash";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `api_url` from the config file
pub const API_URL_ENV: &str = "SENSORDASH_API_URL";

/// Local development backend
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Nothing survives the process
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_url: Option<String>,
    pub last_username: Option<String>,
    pub storage: StorageBackend,
    pub request_timeout_secs: Option<u64>,
    pub refresh_policy: RefreshPolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// API URL from the environment, then the config file, then the default.
    pub fn api_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Per-backend cache directory, so sessions for different API hosts
    /// don't overwrite each other.
    pub fn cache_dir(&self, api_url: &str) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(host_key(api_url)))
    }

    /// Open the configured session storage for `api_url`.
    pub fn open_storage(&self, api_url: &str) -> Result<Box<dyn CredentialStorage>> {
        Ok(match self.storage {
            StorageBackend::File => Box::new(FileStorage::new(self.cache_dir(api_url)?)),
            StorageBackend::Keyring => Box::new(KeyringStorage::with_service(format!(
                "{}:{}",
                APP_NAME,
                host_key(api_url)
            ))),
            StorageBackend::Memory => Box::new(MemoryStorage::new()),
        })
    }
}

/// Filesystem-safe name for the host part of a URL.
fn host_key(api_url: &str) -> String {
    let without_scheme = api_url.split("://").nth(1).unwrap_or(api_url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.refresh_policy, RefreshPolicy::ReturnStale);
        assert_eq!(config.request_timeout(), Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub").join("config.json");
        let config = Config {
            api_url: Some("https://dash.example.com".to_string()),
            last_username: Some("ops".to_string()),
            storage: StorageBackend::Keyring,
            request_timeout_secs: Some(5),
            refresh_policy: RefreshPolicy::AwaitInFlight,
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_url.as_deref(), Some("https://dash.example.com"));
        assert_eq!(loaded.last_username.as_deref(), Some("ops"));
        assert_eq!(loaded.storage, StorageBackend::Keyring);
        assert_eq!(loaded.request_timeout(), Duration::from_secs(5));
        assert_eq!(loaded.refresh_policy, RefreshPolicy::AwaitInFlight);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"refresh_policy": "await_in_flight"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.refresh_policy, RefreshPolicy::AwaitInFlight);
        assert_eq!(config.storage, StorageBackend::File);
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("http://127.0.0.1:5000"), "127.0.0.1_5000");
        assert_eq!(host_key("https://dash.example.com/api/"), "dash.example.com");
        assert_eq!(host_key("localhost"), "localhost");
    }
}
