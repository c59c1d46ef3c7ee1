//! Passphrase sealing for the token file.
//!
//! The key is derived with Argon2 from the passphrase and a random salt, and the
//! payload is sealed with ChaCha20-Poly1305. Salt, nonce and ciphertext are stored
//! base64-encoded next to each other.

use anyhow::{anyhow, Result};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Current envelope format
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sealed {
    pub version: u8,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("Failed to derive key: {}", e))?;
    Ok(key)
}

pub fn seal(passphrase: &str, plaintext: &[u8]) -> Result<Sealed> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow!("Failed to encrypt tokens: {}", e))?;

    Ok(Sealed {
        version: ENVELOPE_VERSION,
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

pub fn open(passphrase: &str, sealed: &Sealed) -> Result<Vec<u8>> {
    if sealed.version != ENVELOPE_VERSION {
        return Err(anyhow!("Unsupported token envelope version {}", sealed.version));
    }

    let salt = STANDARD.decode(&sealed.salt)?;
    let nonce = STANDARD.decode(&sealed.nonce)?;
    let ciphertext = STANDARD.decode(&sealed.ciphertext)?;
    if nonce.len() != NONCE_LEN {
        return Err(anyhow!("Corrupt token envelope: bad nonce length"));
    }

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| anyhow!("Failed to decrypt tokens - wrong passphrase or corrupt file"))
}
