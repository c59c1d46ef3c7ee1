//! Durable storage for the access/refresh token pair.
//!
//! Every store writes the pair as one unit and clears it as one unit, so a
//! reader never sees a new access token next to a stale refresh token.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::crypto::{self, Sealed};

/// Token file name in the cache directory
const TOKEN_FILE: &str = "tokens.json";

/// Keychain service name
const SERVICE_NAME: &str = "bunklogs";

/// Keychain account holding the pair
const KEYRING_ACCOUNT: &str = "session-tokens";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            // An empty refresh slot is the same as none
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Process-wide persistence of the token pair.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<TokenPair>>;

    /// Replace both slots at once.
    fn save(&self, pair: &TokenPair) -> Result<()>;

    /// Remove both slots. Clearing an empty store is not an error.
    fn clear(&self) -> Result<()>;
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: TokenPair) -> Self {
        Self {
            slot: Mutex::new(Some(pair)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(flatten)]
    pair: TokenPair,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TokenFile {
    Sealed { sealed: Sealed },
    Plain(StoredTokens),
}

pub struct FileTokenStore {
    path: PathBuf,
    passphrase: Option<String>,
}

impl FileTokenStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(TOKEN_FILE),
            passphrase: None,
        }
    }

    /// Store the pair encrypted under `passphrase`.
    pub fn encrypted(cache_dir: &Path, passphrase: impl Into<String>) -> Self {
        Self {
            path: cache_dir.join(TOKEN_FILE),
            passphrase: Some(passphrase.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, pair: &TokenPair) -> Result<String> {
        let stored = StoredTokens {
            pair: pair.clone(),
            saved_at: Utc::now(),
        };
        let file = match self.passphrase {
            Some(ref passphrase) => {
                let plaintext = serde_json::to_vec(&stored)?;
                TokenFile::Sealed {
                    sealed: crypto::seal(passphrase, &plaintext)?,
                }
            }
            None => TokenFile::Plain(stored),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    fn decode(&self, contents: &str) -> Result<TokenPair> {
        let file: TokenFile =
            serde_json::from_str(contents).context("Failed to parse token file")?;
        let stored = match (file, self.passphrase.as_deref()) {
            (TokenFile::Plain(stored), _) => stored,
            (TokenFile::Sealed { sealed }, Some(passphrase)) => {
                let plaintext = crypto::open(passphrase, &sealed)?;
                serde_json::from_slice(&plaintext).context("Failed to parse decrypted tokens")?
            }
            (TokenFile::Sealed { .. }, None) => {
                anyhow::bail!("Token file is encrypted but no passphrase is configured")
            }
        };
        Ok(stored.pair)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<TokenPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read token file")?;
        self.decode(&contents).map(Some)
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.encode(pair)?;

        // Write beside the target and rename so the pair lands in one step
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write token file")?;
        restrict_to_owner(&tmp)?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace token file")?;
        debug!(path = ?self.path, "Tokens saved");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove token file")?;
        }
        Ok(())
    }
}

/// Owner read/write only; the pair may be unencrypted.
#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict token file permissions")
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// OS keychain
// ============================================================================

pub struct KeyringTokenStore {
    account: String,
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self::for_account(KEYRING_ACCOUNT)
    }

    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Result<Option<TokenPair>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let pair = serde_json::from_str(&secret)
                    .context("Failed to parse tokens from keychain")?;
                Ok(Some(pair))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve tokens from keychain"),
        }
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        let secret = serde_json::to_string(pair)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store tokens in keychain")
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete tokens from keychain"),
        }
    }
}
