//! Application configuration management.
//!
//! This module handles loading and saving the configuration: backend URL,
//! refresh endpoint, timeouts, and where the session tokens are kept.
//!
//! Configuration is stored at `~/.config/bunklogs/config.json`; a few values
//! can be overridden from the environment (see the `ENV_*` constants).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::client::DEFAULT_REFRESH_PATH;
use crate::auth::{FileTokenStore, KeyringTokenStore, TokenStore, DEFAULT_REFRESH_TIMEOUT};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "bunklogs";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_API_URL: &str = "BUNKLOGS_API_URL";
pub const ENV_TOKEN_STORAGE: &str = "BUNKLOGS_TOKEN_STORAGE";
pub const ENV_TOKEN_PASSPHRASE: &str = "BUNKLOGS_TOKEN_PASSPHRASE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStorage {
    #[default]
    File,
    EncryptedFile,
    Keyring,
}

impl std::str::FromStr for TokenStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(TokenStorage::File),
            "encrypted_file" | "encrypted-file" => Ok(TokenStorage::EncryptedFile),
            "keyring" => Ok(TokenStorage::Keyring),
            other => Err(anyhow::anyhow!("Unknown token storage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub refresh_path: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub refresh_timeout_secs: Option<u64>,
    pub token_storage: TokenStorage,
    pub last_email: Option<String>,
    /// Set from the environment only, never written to disk
    #[serde(skip)]
    pub token_passphrase: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            debug!(url = %url, "API URL overridden from environment");
            self.api_base_url = Some(url);
        }
        if let Some(storage) = lookup(ENV_TOKEN_STORAGE).filter(|v| !v.is_empty()) {
            self.token_storage = storage.parse()?;
        }
        if let Some(passphrase) = lookup(ENV_TOKEN_PASSPHRASE).filter(|v| !v.is_empty()) {
            self.token_passphrase = Some(passphrase);
        }
        Ok(self)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
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

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    pub fn refresh_path(&self) -> String {
        self.refresh_path
            .clone()
            .unwrap_or_else(|| DEFAULT_REFRESH_PATH.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFRESH_TIMEOUT)
    }
}

/// Open the token store selected by `config`.
pub fn open_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.token_storage {
        TokenStorage::File => Arc::new(FileTokenStore::new(&config.cache_dir()?)),
        TokenStorage::EncryptedFile => {
            let passphrase = config.token_passphrase.clone().ok_or_else(|| {
                anyhow::anyhow!("{} must be set for encrypted token storage", ENV_TOKEN_PASSPHRASE)
            })?;
            Arc::new(FileTokenStore::encrypted(&config.cache_dir()?, passphrase))
        }
        TokenStorage::Keyring => Arc::new(KeyringTokenStore::new()),
    };
    debug!(storage = ?config.token_storage, "Token store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base_url(), "http://localhost:8000");
        assert_eq!(config.refresh_path(), "/api/auth/token/refresh/");
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.token_storage, TokenStorage::File);
    }

    #[test]
    fn test_partial_file_parses() {
        let config: Config =
            serde_json::from_str(r#"{ "api_base_url": "https://api.camp.example", "token_storage": "keyring" }"#)
                .unwrap();
        assert_eq!(config.api_base_url(), "https://api.camp.example");
        assert_eq!(config.token_storage, TokenStorage::Keyring);
        assert_eq!(config.last_email, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_env_overrides(env(&[
                (ENV_API_URL, "https://staging.camp.example"),
                (ENV_TOKEN_STORAGE, "encrypted-file"),
                (ENV_TOKEN_PASSPHRASE, "campfire"),
            ]))
            .unwrap();
        assert_eq!(config.api_base_url(), "https://staging.camp.example");
        assert_eq!(config.token_storage, TokenStorage::EncryptedFile);
        assert_eq!(config.token_passphrase.as_deref(), Some("campfire"));
    }

    #[test]
    fn test_bad_storage_override_fails() {
        assert!(Config::default()
            .with_env_overrides(env(&[(ENV_TOKEN_STORAGE, "floppy")]))
            .is_err());
    }

    #[test]
    fn test_passphrase_is_not_serialized() {
        let config = Config {
            token_passphrase: Some("campfire".into()),
            ..Config::default()
        };
        assert!(!serde_json::to_string(&config).unwrap().contains("campfire"));
    }

    #[test]
    fn test_encrypted_storage_requires_passphrase() {
        let config = Config {
            token_storage: TokenStorage::EncryptedFile,
            ..Config::default()
        };
        assert!(open_store(&config).is_err());
    }
}
