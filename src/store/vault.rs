//! At-rest sealing for contact addresses.
//!
//! AES-256-GCM with a fresh 96-bit nonce per write. The key is the SHA-256
//! digest of the configured secret, and the visitor id is bound in as
//! associated data so a sealed address cannot be moved to another visitor.
//! Stored form is base64 of `nonce || ciphertext`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;

const NONCE_LEN: usize = 12;

pub struct ContactCipher {
    cipher: Aes256Gcm,
}

impl ContactCipher {
    pub fn from_secret(secret: &SecretString) -> Result<Self, StoreError> {
        let key = Sha256::digest(secret.expose_secret().as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| StoreError::Serialization("contact vault key: invalid length".into()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, visitor_id: Uuid, address: &str) -> Result<String, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: address.as_bytes(),
                    aad: visitor_id.as_bytes(),
                },
            )
            .map_err(|_| StoreError::Serialization("contact vault: encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn open(&self, visitor_id: Uuid, sealed: &str) -> Result<String, StoreError> {
        let raw = BASE64
            .decode(sealed.as_bytes())
            .map_err(|e| StoreError::Serialization(format!("contact vault: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(StoreError::Serialization("contact vault: truncated entry".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: visitor_id.as_bytes(),
                },
            )
            .map_err(|_| StoreError::Serialization("contact vault: decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| StoreError::Serialization("contact vault: address is not UTF-8".into()))
    }
}
