//! Authenticated wrapping of the private key built on AES-256-GCM.
//! Wrapped records are stored as nonce + ciphertext + auth tag so the key
//! slot of the backing store only ever holds one opaque blob.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::kdf::WrappingKey;

/// 96-bit GCM nonce.
pub const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymmetricError {
    /// Wrong password and a tampered record are indistinguishable here.
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// AES-256-GCM envelope keyed by a derived [`WrappingKey`].
pub struct SymmetricEnvelope {
    key: WrappingKey,
}

impl SymmetricEnvelope {
    pub fn new(key: WrappingKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()))
    }

    /// Seals `plaintext` under the caller-provided nonce. A nonce must never
    /// be reused with the same key; [`SymmetricEnvelope::wrap`] draws one per call.
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SymmetricError> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| SymmetricError::EncryptionFailed)
    }

    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SymmetricError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(SymmetricError::AuthenticationFailed);
        }
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| SymmetricError::AuthenticationFailed)
    }

    /// Seals under a fresh random nonce and returns `nonce || ciphertext`.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SymmetricError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self.seal(&nonce, plaintext)?;
        let mut record = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Opens a `nonce || ciphertext` record produced by [`SymmetricEnvelope::wrap`].
    pub fn unwrap(&self, record: &[u8]) -> Result<Zeroizing<Vec<u8>>, SymmetricError> {
        if record.len() < NONCE_SIZE {
            return Err(SymmetricError::AuthenticationFailed);
        }
        let (nonce_bytes, ciphertext) = record.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        self.open(&nonce, ciphertext)
    }
}
