//! Credential vault — authenticated encryption of session material at rest.
//!
//! Sessions are sealed with AES-256-GCM under a process-wide key and stored
//! as a colon-delimited triple `<hex-nonce>:<hex-ciphertext>:<hex-tag>`.
//! The plaintext session string is never persisted.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::error::VaultError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Process-wide vault. The key is fixed at construction and the cipher is
/// safe for concurrent use from multiple tasks.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build a vault from the configured master key.
    ///
    /// The key material is zero-padded or truncated to exactly 32 bytes, so
    /// any configured string yields a usable (deterministic) key. Callers
    /// must not rely on short keys being rejected.
    pub fn new(master_key: &SecretString) -> Self {
        let mut key = [0u8; KEY_LEN];
        for (slot, byte) in key
            .iter_mut()
            .zip(master_key.expose_secret().as_bytes().iter())
        {
            *slot = *byte;
        }
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Seal a plaintext session string into an at-rest record.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Cipher(format!("encryption failed: {e}")))?;

        // aes-gcm appends the 16-byte tag to the ciphertext; split it back
        // out so the record carries the three fields separately.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(&sealed),
            hex::encode(&tag)
        ))
    }

    /// Open an at-rest record back into the plaintext session string.
    ///
    /// Any structural problem (wrong field count, non-hex fields, bad
    /// lengths) or tag mismatch yields `VaultError::Integrity`.
    pub fn decrypt(&self, record: &str) -> Result<String, VaultError> {
        let parts: Vec<&str> = record.split(':').collect();
        if parts.len() != 3 {
            return Err(VaultError::Integrity(format!(
                "expected 3 fields, found {}",
                parts.len()
            )));
        }

        let nonce_bytes = decode_field(parts[0], "nonce")?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VaultError::Integrity(format!(
                "nonce is {} bytes, expected {NONCE_LEN}",
                nonce_bytes.len()
            )));
        }
        let mut sealed = decode_field(parts[1], "ciphertext")?;
        let tag = decode_field(parts[2], "tag")?;
        if tag.len() != TAG_LEN {
            return Err(VaultError::Integrity(format!(
                "tag is {} bytes, expected {TAG_LEN}",
                tag.len()
            )));
        }
        sealed.extend_from_slice(&tag);

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| VaultError::Integrity("authentication tag mismatch".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Integrity("decrypted payload is not UTF-8".to_string()))
    }
}

fn decode_field(field: &str, name: &str) -> Result<Vec<u8>, VaultError> {
    hex::decode(field).map_err(|_| VaultError::Integrity(format!("{name} field is not hex")))
}
