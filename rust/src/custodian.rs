//! Custody of the deployment's single P-521 key pair.
//!
//! The private key is persisted only as a symmetric envelope keyed by the
//! master password and the configured salt. The master password lives in a
//! per-instance slot and every operation holds that slot's mutex for its full
//! duration, so unlock, establish, rotation and reset never interleave.
//!
//! A record this custodian wrote is preferred over the cached key slot until
//! the cache shows it, so a failed refresh after a rewrap cannot pair the new
//! salt with the old record.

use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use p521::PublicKey;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::cache::CachedSecretStore;
use crate::config::{generate_salt, ConfigError, SaltStore};
use crate::crypto::kdf::{KdfError, KeyDerivation, WrappingKey};
use crate::crypto::keypair::{KeyError, KeyPair};
use crate::crypto::symmetric::{SymmetricEnvelope, SymmetricError};
use crate::encoding::{self, EncodingError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CustodianError {
    #[error("locked: no master password set")]
    Locked,
    #[error("no wrapped key has been established")]
    MissingKey,
    #[error("wrapped key record is not valid text: {0}")]
    MalformedRecord(#[from] EncodingError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Symmetric(#[from] SymmetricError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("wrapped key write failed, previous salt restored: {0}")]
    RotationRolledBack(StoreError),
    #[error(
        "wrapped key write failed ({write}) and restoring the previous salt failed ({restore})"
    )]
    RollbackFailed {
        write: StoreError,
        restore: ConfigError,
    },
    #[error("key derivation task failed: {0}")]
    Task(String),
}

impl CustodianError {
    /// True for the single signal a wrong password (or a tampered record) produces.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, CustodianError::Symmetric(SymmetricError::AuthenticationFailed))
    }
}

/// Master password held only in memory.
#[derive(Clone)]
struct MasterPassword(Zeroizing<String>);

impl MasterPassword {
    fn new(password: &str) -> Self {
        Self(Zeroizing::new(password.to_string()))
    }
}

impl fmt::Debug for MasterPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterPassword(<redacted>)")
    }
}

/// Result of an unlock attempt.
#[derive(Debug)]
pub struct Unlocked {
    /// The recovered key pair; `None` exactly when no record existed.
    pub key_pair: Option<KeyPair>,
    pub existed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// An existing wrapped key opened under the password.
    Existing,
    /// No key existed, so a new pair was generated and wrapped.
    Generated,
}

pub struct KeyCustodian {
    cache: Arc<CachedSecretStore>,
    salts: Arc<dyn SaltStore>,
    kdf: KeyDerivation,
    master: Mutex<Option<MasterPassword>>,
    /// Last record written through this custodian, until the cache catches up.
    written: SyncMutex<Option<String>>,
}

impl KeyCustodian {
    pub fn new(cache: Arc<CachedSecretStore>, salts: Arc<dyn SaltStore>) -> Self {
        Self::with_kdf(cache, salts, KeyDerivation::new())
    }

    pub fn with_kdf(
        cache: Arc<CachedSecretStore>,
        salts: Arc<dyn SaltStore>,
        kdf: KeyDerivation,
    ) -> Self {
        Self {
            cache,
            salts,
            kdf,
            master: Mutex::new(None),
            written: SyncMutex::new(None),
        }
    }

    /// Opens the current wrapped key with `password` and the current salt.
    /// Does not change the master password slot.
    pub async fn unlock(&self, password: &str) -> Result<Unlocked, CustodianError> {
        let _slot = self.master.lock().await;
        self.unlock_with(&MasterPassword::new(password)).await
    }

    /// Generates a new key pair and stores it wrapped under `password`,
    /// replacing any previous record.
    pub async fn establish(&self, password: &str) -> Result<KeyPair, CustodianError> {
        let _slot = self.master.lock().await;
        self.establish_with(&MasterPassword::new(password)).await
    }

    /// Unlocks with `password`, or establishes a key if none exists, then
    /// keeps the password as the master password.
    pub async fn set_master_password(&self, password: &str) -> Result<KeyStatus, CustodianError> {
        let mut slot = self.master.lock().await;
        let candidate = MasterPassword::new(password);
        let status = match self.unlock_with(&candidate).await? {
            Unlocked { existed: true, .. } => KeyStatus::Existing,
            Unlocked { existed: false, .. } => {
                self.establish_with(&candidate).await?;
                KeyStatus::Generated
            }
        };
        *slot = Some(candidate);
        info!(?status, "master password set");
        Ok(status)
    }

    /// Re-wraps the unlocked key under the same password and `new_salt`.
    pub async fn rotate_salt(&self, new_salt: &str) -> Result<(), CustodianError> {
        let slot = self.master.lock().await;
        let password = slot.as_ref().ok_or(CustodianError::Locked)?;
        let key_pair = self.require_key(password).await?;
        let old_salt = self.salts.current_salt()?;

        self.rewrap(&key_pair, password, &old_salt, new_salt).await?;
        info!("salt rotated");
        Ok(())
    }

    /// Re-wraps the unlocked key under `new_password` and a freshly generated
    /// salt. The slot switches to the new password only once both are persisted.
    pub async fn reset_password(&self, new_password: &str) -> Result<(), CustodianError> {
        let mut slot = self.master.lock().await;
        let current = slot.as_ref().ok_or(CustodianError::Locked)?;
        let key_pair = self.require_key(current).await?;
        let old_salt = self.salts.current_salt()?;

        let replacement = MasterPassword::new(new_password);
        self.rewrap(&key_pair, &replacement, &old_salt, &generate_salt())
            .await?;
        *slot = Some(replacement);
        info!("master password reset");
        Ok(())
    }

    /// Forgets the master password.
    pub async fn lock(&self) {
        *self.master.lock().await = None;
        info!("custodian locked");
    }

    pub async fn is_locked(&self) -> bool {
        self.master.lock().await.is_none()
    }

    /// Recovers the private key with the master password.
    pub async fn private_key(&self) -> Result<KeyPair, CustodianError> {
        let slot = self.master.lock().await;
        let password = slot.as_ref().ok_or(CustodianError::Locked)?;
        self.require_key(password).await
    }

    pub async fn public_key(&self) -> Result<PublicKey, CustodianError> {
        Ok(self.private_key().await?.public_key().clone())
    }

    async fn require_key(&self, password: &MasterPassword) -> Result<KeyPair, CustodianError> {
        self.unlock_with(password)
            .await?
            .key_pair
            .ok_or(CustodianError::MissingKey)
    }

    async fn unlock_with(&self, password: &MasterPassword) -> Result<Unlocked, CustodianError> {
        let Some(record) = self.current_record() else {
            return Ok(Unlocked {
                key_pair: None,
                existed: false,
            });
        };
        let salt = self.salts.current_salt()?;
        let key_pair = self.open_record(password, &salt, &record).await?;
        Ok(Unlocked {
            key_pair: Some(key_pair),
            existed: true,
        })
    }

    /// The wrapped key to open: our own pending write if the cache has not
    /// caught up with it yet, otherwise the cached key slot.
    fn current_record(&self) -> Option<String> {
        let cached = self.cache.get().key.clone();
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if written.is_some() && *written == cached {
            *written = None;
        }
        written.clone().or(cached)
    }

    async fn establish_with(&self, password: &MasterPassword) -> Result<KeyPair, CustodianError> {
        let key_pair = KeyPair::generate();
        let salt = self.salts.current_salt()?;
        let record = self.wrap_key(&key_pair, password, &salt).await?;
        self.store_record(&record).await?;
        info!("new key pair generated and stored");
        Ok(key_pair)
    }

    async fn derive(
        &self,
        password: &MasterPassword,
        salt: &str,
    ) -> Result<WrappingKey, CustodianError> {
        let kdf = self.kdf;
        let password = password.clone();
        let salt = salt.to_string();
        tokio::task::spawn_blocking(move || kdf.derive(password.0.as_bytes(), salt.as_bytes()))
            .await
            .map_err(|e| CustodianError::Task(format!("{e}")))?
            .map_err(CustodianError::from)
    }

    async fn wrap_key(
        &self,
        key_pair: &KeyPair,
        password: &MasterPassword,
        salt: &str,
    ) -> Result<String, CustodianError> {
        let der = key_pair.to_pkcs8_der()?;
        let envelope = SymmetricEnvelope::new(self.derive(password, salt).await?);
        Ok(encoding::encode(&envelope.wrap(&der)?))
    }

    async fn open_record(
        &self,
        password: &MasterPassword,
        salt: &str,
        record: &str,
    ) -> Result<KeyPair, CustodianError> {
        let sealed = encoding::decode(record)?;
        let envelope = SymmetricEnvelope::new(self.derive(password, salt).await?);
        let der = envelope.unwrap(&sealed)?;
        Ok(KeyPair::from_pkcs8_der(&der)?)
    }

    async fn store_record(&self, record: &str) -> Result<(), StoreError> {
        self.cache.set_key(record).await?;
        *self.written.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.to_string());
        if self.cache.refresh().await.is_err() {
            warn!("cache still holds the previous key record, using the one just written");
        }
        Ok(())
    }

    /// Persists the new salt, then the record wrapped under it. If the record
    /// write fails the old salt is put back before reporting.
    async fn rewrap(
        &self,
        key_pair: &KeyPair,
        password: &MasterPassword,
        old_salt: &str,
        new_salt: &str,
    ) -> Result<(), CustodianError> {
        let record = self.wrap_key(key_pair, password, new_salt).await?;
        self.salts.persist_salt(new_salt)?;

        if let Err(write) = self.store_record(&record).await {
            error!(error = %write, "wrapped key write failed after salt change, rolling back");
            return match self.salts.persist_salt(old_salt) {
                Ok(()) => {
                    warn!("previous salt restored");
                    Err(CustodianError::RotationRolledBack(write))
                }
                Err(restore) => {
                    error!(error = %restore, "unable to restore previous salt");
                    Err(CustodianError::RollbackFailed { write, restore })
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CustodianError, KeyCustodian, KeyStatus};
    use crate::cache::CachedSecretStore;
    use crate::config::testing::MemorySaltStore;
    use crate::config::{FileSaltStore, SaltStore};
    use crate::crypto::kdf::KeyDerivation;
    use crate::crypto::symmetric::SymmetricError;
    use crate::store::{MemoryRowStore, Sheet, StoreError};
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn custodian_with(salts: Arc<dyn SaltStore>) -> (KeyCustodian, Arc<MemoryRowStore>) {
        let remote = Arc::new(MemoryRowStore::new());
        let cache = Arc::new(CachedSecretStore::connect(remote.clone()).await.unwrap());
        let custodian = KeyCustodian::with_kdf(cache, salts, KeyDerivation::with_iterations(1_000));
        (custodian, remote)
    }

    #[tokio::test]
    async fn correct_horse_scenario() {
        let (custodian, _) = custodian_with(Arc::new(MemorySaltStore::new("abc123"))).await;

        let established = custodian.establish("correct horse").await.expect("establish");
        let unlocked = custodian.unlock("correct horse").await.expect("unlock");
        assert!(unlocked.existed);
        assert_eq!(
            unlocked.key_pair.expect("key pair").public_key_bytes(),
            established.public_key_bytes()
        );

        let err = custodian.unlock("wrong").await.unwrap_err();
        assert!(matches!(
            err,
            CustodianError::Symmetric(SymmetricError::AuthenticationFailed)
        ));
        assert!(err.is_authentication_failure());
    }

    #[tokio::test]
    async fn unlock_without_record_reports_absence() {
        let (custodian, _) = custodian_with(Arc::new(MemorySaltStore::new("abc123"))).await;
        let unlocked = custodian.unlock("anything").await.unwrap();
        assert!(!unlocked.existed);
        assert!(unlocked.key_pair.is_none());
    }

    #[tokio::test]
    async fn set_master_password_generates_once_then_reuses() {
        let (custodian, _) = custodian_with(Arc::new(MemorySaltStore::new("abc123"))).await;
        assert!(custodian.is_locked().await);

        assert_eq!(custodian.set_master_password("pw").await.unwrap(), KeyStatus::Generated);
        let first = custodian.private_key().await.unwrap().public_key_bytes();
        assert_eq!(custodian.set_master_password("pw").await.unwrap(), KeyStatus::Existing);
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), first);

        assert!(custodian.set_master_password("other").await.is_err());
        assert!(!custodian.is_locked().await);
    }

    #[tokio::test]
    async fn locked_operations_are_rejected() {
        let (custodian, _) = custodian_with(Arc::new(MemorySaltStore::new("abc123"))).await;
        assert!(matches!(custodian.private_key().await, Err(CustodianError::Locked)));
        assert!(matches!(custodian.rotate_salt("new").await, Err(CustodianError::Locked)));
        assert!(matches!(custodian.reset_password("new").await, Err(CustodianError::Locked)));

        custodian.set_master_password("pw").await.unwrap();
        custodian.lock().await;
        assert!(matches!(custodian.public_key().await, Err(CustodianError::Locked)));
    }

    #[tokio::test]
    async fn rotation_rewraps_under_new_salt() {
        let salts = Arc::new(MemorySaltStore::new("abc123"));
        let (custodian, _) = custodian_with(salts.clone()).await;
        custodian.set_master_password("pw").await.unwrap();
        let before = custodian.private_key().await.unwrap().public_key_bytes();

        custodian.rotate_salt("fresh-salt").await.unwrap();
        assert_eq!(salts.current_salt().unwrap(), "fresh-salt");
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), before);
    }

    #[tokio::test]
    async fn failed_key_write_rolls_back_salt_on_disk() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("secretable.json");
        fs::write(&path, serde_json::to_vec(&json!({ "salt": "abc123" })).unwrap()).unwrap();

        let salts = Arc::new(FileSaltStore::new(&path));
        let (custodian, remote) = custodian_with(salts.clone()).await;
        custodian.set_master_password("correct horse").await.unwrap();
        let before = custodian.private_key().await.unwrap().public_key_bytes();

        remote.set_write_failure(Sheet::Keys, true);
        let err = custodian.rotate_salt("fresh-salt").await.unwrap_err();
        assert!(matches!(
            err,
            CustodianError::RotationRolledBack(StoreError::Unavailable(_))
        ));
        assert_eq!(salts.current_salt().unwrap(), "abc123");

        remote.set_write_failure(Sheet::Keys, false);
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), before);
    }

    #[tokio::test]
    async fn stale_cache_after_rotation_still_unlocks_with_new_salt() {
        let salts = Arc::new(MemorySaltStore::new("abc123"));
        let (custodian, remote) = custodian_with(salts.clone()).await;
        custodian.set_master_password("pw").await.unwrap();
        let before = custodian.private_key().await.unwrap().public_key_bytes();

        remote.set_read_failure(true);
        custodian.rotate_salt("fresh").await.unwrap();
        assert_eq!(salts.current_salt().unwrap(), "fresh");
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), before);

        custodian.reset_password("next").await.unwrap();
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), before);

        remote.set_read_failure(false);
        assert_eq!(custodian.private_key().await.unwrap().public_key_bytes(), before);
        assert!(custodian.unlock("pw").await.unwrap_err().is_authentication_failure());
    }

    #[tokio::test]
    async fn salt_persist_failure_leaves_record_untouched() {
        let salts = Arc::new(MemorySaltStore::new("abc123"));
        let (custodian, _) = custodian_with(salts.clone()).await;
        custodian.set_master_password("pw").await.unwrap();

        salts.set_persist_failure(true);
        assert!(matches!(
            custodian.rotate_salt("fresh").await,
            Err(CustodianError::Config(_))
        ));
        salts.set_persist_failure(false);
        assert!(custodian.private_key().await.is_ok());
    }

    #[tokio::test]
    async fn reset_password_switches_password_and_salt() {
        let salts = Arc::new(MemorySaltStore::new("abc123"));
        let (custodian, _) = custodian_with(salts.clone()).await;
        custodian.set_master_password("old").await.unwrap();
        let before = custodian.private_key().await.unwrap().public_key_bytes();

        custodian.reset_password("new").await.unwrap();
        assert_ne!(salts.current_salt().unwrap(), "abc123");
        assert!(custodian.unlock("old").await.unwrap_err().is_authentication_failure());
        let unlocked = custodian.unlock("new").await.unwrap();
        assert_eq!(unlocked.key_pair.unwrap().public_key_bytes(), before);
    }

    #[tokio::test]
    async fn failed_reset_keeps_old_password() {
        let salts = Arc::new(MemorySaltStore::new("abc123"));
        let (custodian, remote) = custodian_with(salts.clone()).await;
        custodian.set_master_password("old").await.unwrap();

        remote.set_write_failure(Sheet::Keys, true);
        assert!(matches!(
            custodian.reset_password("new").await,
            Err(CustodianError::RotationRolledBack(_))
        ));
        remote.set_write_failure(Sheet::Keys, false);
        assert_eq!(salts.current_salt().unwrap(), "abc123");
        assert!(custodian.private_key().await.is_ok());
    }
}
