//! Credential operations on top of the custodian and the cache.
//!
//! Descriptions stay in plaintext; usernames and secrets are stored as
//! text-encoded hybrid envelopes under the deployment's public key.

use std::fmt;
use std::sync::Arc;

use p521::{PublicKey, SecretKey};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::cache::CachedSecretStore;
use crate::crypto::asymmetric::{self, AsymmetricError};
use crate::custodian::{CustodianError, KeyCustodian, KeyStatus};
use crate::encoding;
use crate::store::{SecretRecord, StoreError};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master password must not be empty")]
    EmptyPassword,
    #[error(transparent)]
    Custodian(#[from] CustodianError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encryption failed: {0}")]
    Encrypt(#[from] AsymmetricError),
    #[error("cannot decrypt row {index}: {reason}")]
    Undecryptable { index: usize, reason: String },
}

/// One decrypted credential. The decrypted fields are wiped on drop.
pub struct RevealedSecret {
    /// Remote row position; pass it to [`Vault::delete`]. Valid only until
    /// the next write.
    pub index: usize,
    pub description: String,
    pub username: Zeroizing<String>,
    pub secret: Zeroizing<String>,
}

impl fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("index", &self.index)
            .field("description", &self.description)
            .field("username", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub struct Vault {
    cache: Arc<CachedSecretStore>,
    custodian: KeyCustodian,
}

impl Vault {
    pub fn new(cache: Arc<CachedSecretStore>, custodian: KeyCustodian) -> Self {
        Self { cache, custodian }
    }

    pub fn custodian(&self) -> &KeyCustodian {
        &self.custodian
    }

    pub async fn set_master_password(&self, password: &str) -> Result<KeyStatus, VaultError> {
        if password.is_empty() {
            return Err(VaultError::EmptyPassword);
        }
        Ok(self.custodian.set_master_password(password).await?)
    }

    /// Encrypts both fields under the public key and appends the row. The
    /// row appears in queries after the next cache refresh.
    pub async fn add_secret(
        &self,
        description: &str,
        username: &str,
        secret: &str,
    ) -> Result<(), VaultError> {
        let public_key = self.custodian.public_key().await?;
        let record = SecretRecord {
            description: description.to_string(),
            username: seal_field(&public_key, username)?,
            secret: seal_field(&public_key, secret)?,
        };
        self.cache.append(&record).await?;
        info!(description, "secret added");
        Ok(())
    }

    /// Returns every row whose description contains `text`, ignoring case.
    /// Any field that fails to decrypt fails the whole query.
    pub async fn query(&self, text: &str) -> Result<Vec<RevealedSecret>, VaultError> {
        let key_pair = self.custodian.private_key().await?;
        let needle = text.to_lowercase();
        let snapshot = self.cache.get();

        snapshot
            .secrets
            .iter()
            .filter(|entry| entry.record.description.to_lowercase().contains(&needle))
            .map(|entry| -> Result<RevealedSecret, VaultError> {
                let (index, record) = (entry.row, &entry.record);
                Ok(RevealedSecret {
                    index,
                    description: record.description.clone(),
                    username: open_field(key_pair.secret_key(), index, &record.username)?,
                    secret: open_field(key_pair.secret_key(), index, &record.secret)?,
                })
            })
            .collect()
    }

    /// Deletes the row at `index` as reported by [`Vault::query`].
    pub async fn delete(&self, index: usize) -> Result<(), VaultError> {
        self.cache.delete(index).await?;
        info!(index, "secret deleted");
        Ok(())
    }

    pub async fn rotate_salt(&self, new_salt: &str) -> Result<(), VaultError> {
        Ok(self.custodian.rotate_salt(new_salt).await?)
    }

    pub async fn reset_password(&self, new_password: &str) -> Result<(), VaultError> {
        if new_password.is_empty() {
            return Err(VaultError::EmptyPassword);
        }
        Ok(self.custodian.reset_password(new_password).await?)
    }

    pub async fn lock(&self) {
        self.custodian.lock().await;
    }
}

fn seal_field(public_key: &PublicKey, field: &str) -> Result<String, VaultError> {
    Ok(encoding::encode(&asymmetric::encrypt(public_key, field.as_bytes())?))
}

fn open_field(
    secret_key: &SecretKey,
    index: usize,
    field: &str,
) -> Result<Zeroizing<String>, VaultError> {
    let undecryptable = |reason: String| {
        warn!(index, %reason, "stored field cannot be decrypted");
        VaultError::Undecryptable { index, reason }
    };
    let blob = encoding::decode(field).map_err(|e| undecryptable(format!("{e}")))?;
    let plaintext =
        asymmetric::decrypt(secret_key, &blob).map_err(|e| undecryptable(format!("{e}")))?;
    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| undecryptable("plaintext is not UTF-8".to_string()))?;
    Ok(Zeroizing::new(text.to_string()))
}
