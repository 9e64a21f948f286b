use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;

use crate::error::CiError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM key for CI trigger credentials at rest.
/// Wire format of an encrypted value: base64(nonce || ciphertext).
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .context("secret key is not valid base64")?;
        if bytes.len() != 32 {
            bail!("secret key must be 32 bytes, got {}", bytes.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| anyhow::anyhow!("invalid secret key length"))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt an at-rest credential. Any failure here is a configuration
    /// or secret-rotation problem, never a transient one.
    pub fn decrypt(&self, encoded: &str) -> Result<String, CiError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CiError::config(format!("encrypted credential is not valid base64: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(CiError::config("encrypted credential is truncated"));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| CiError::config("invalid secret key length"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CiError::config("credential decryption failed; was the key rotated?"))?;
        String::from_utf8(plaintext)
            .map_err(|_| CiError::config("decrypted credential is not valid UTF-8"))
    }
}
