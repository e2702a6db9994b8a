// At-rest encryption for secret values in the embedded vault backend.
// AES-256-GCM with a fresh nonce per value; stored form is
// "aesgcm:" + base64(nonce || ciphertext).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PREFIX: &str = "aesgcm:";

#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .context("Failed to decode encryption key from base64")?;
        if key_bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "Encryption key must be {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            );
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Create from SECRETS_ENCRYPTION_KEY
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("SECRETS_ENCRYPTION_KEY")
            .context("SECRETS_ENCRYPTION_KEY environment variable not set")?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{PREFIX}{}", BASE64.encode(combined)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let encoded = stored
            .strip_prefix(PREFIX)
            .context("Value is not an encrypted payload")?;
        let combined = BASE64
            .decode(encoded)
            .context("Failed to decode encrypted payload")?;
        if combined.len() < NONCE_SIZE {
            anyhow::bail!("Encrypted payload too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed (data may be corrupted): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Is this stored value an encrypted payload?
    pub fn is_encrypted(stored: &str) -> bool {
        stored.starts_with(PREFIX)
    }
}

/// Generate a new random key in the accepted base64 format
pub fn generate_encryption_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}
