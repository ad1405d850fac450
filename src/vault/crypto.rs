//! Credential column encryption.
//!
//! AES-256-GCM with a random 96-bit nonce. Stored values carry a version
//! prefix (`v1:BASE64(nonce||ciphertext)`) so the key can be rotated without a
//! flag-day migration. Decryption failures are observable, never fatal: the
//! vault treats an undecryptable column as a missing credential, forcing a
//! relink.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// Current ciphertext format version prefix
const VERSION_PREFIX: &str = "v1:";

/// Cipher handle shared by the vault. Cheap to clone.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; KEY_LENGTH],
}

impl CredentialCipher {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Build a cipher from hex- or base64-encoded key material.
    pub fn from_key_material(key_str: &str) -> Result<Self> {
        parse_key(key_str).map(Self::new)
    }

    /// Encrypt a plaintext value into the versioned wire format.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", VERSION_PREFIX, BASE64.encode(&combined)))
    }

    /// Decrypt a stored value.
    ///
    /// Returns `None` on any failure (unknown version, truncated payload, tag
    /// mismatch); the caller must treat the credential as missing rather than
    /// surface raw ciphertext.
    pub fn decrypt(&self, stored: &str) -> Option<String> {
        let payload = stored.strip_prefix(VERSION_PREFIX)?;

        let combined = BASE64.decode(payload).ok()?;
        if combined.len() < NONCE_LENGTH {
            return None;
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// Parse a key from hex or base64 format.
fn parse_key(key_str: &str) -> Result<[u8; KEY_LENGTH]> {
    let trimmed = key_str.trim();

    // Try hex first (64 characters = 32 bytes)
    if trimmed.len() == KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed).context("Invalid hex key")?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    // Try base64
    let bytes = BASE64
        .decode(trimmed)
        .context("Key is neither valid hex nor base64")?;

    if bytes.len() != KEY_LENGTH {
        return Err(anyhow!(
            "Key must be {} bytes, got {} bytes",
            KEY_LENGTH,
            bytes.len()
        ));
    }

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a new random encryption key.
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
