//! Configuration loader and salt persistence. The salt lives in the config
//! file next to the operational settings and must only change together with
//! the wrapped key derived from it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::encoding;

/// Random bytes drawn for a generated salt.
pub const SALT_LEN: usize = 32;
const DEFAULT_REFRESH_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("config persist failed: {0}")]
    Persist(String),
    #[error("no salt configured")]
    MissingSalt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// JSON file used as the local backing store.
    #[serde(rename = "storagePath", default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Seconds between cache refresh cycles.
    #[serde(rename = "refreshIntervalSecs", default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Text form of the key-derivation salt; its UTF-8 bytes feed PBKDF2.
    #[serde(default)]
    pub salt: String,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("storage.json")
}

fn default_refresh_secs() -> u64 {
    DEFAULT_REFRESH_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            refresh_interval_secs: DEFAULT_REFRESH_SECS,
            salt: String::new(),
        }
    }
}

impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Generates a fresh random salt in its stored text form.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut bytes);
    encoding::encode(&bytes)
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{e}")))?;
    if raw.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(format!("{e}")))
}

/// Replaces `path` with `bytes` through a sibling temp file and an atomic
/// rename, so readers see either the old or the new content, never a torn file.
pub(crate) fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path)?;
    Ok(())
}

pub fn save_config(path: impl AsRef<Path>, config: &Config) -> Result<(), ConfigError> {
    let encoded =
        serde_json::to_vec_pretty(config).map_err(|e| ConfigError::Persist(format!("{e}")))?;
    replace_file(path.as_ref(), &encoded).map_err(|e| ConfigError::Persist(format!("{e}")))
}

/// Loads the JSON configuration, creating the file when missing and
/// generating a salt when none is configured yet.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        read_config(path)?
    } else {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io(format!("{e}")))?;
        }
        info!(path = %path.display(), "created config file");
        Config::default()
    };

    if config.salt.is_empty() {
        config.salt = generate_salt();
        save_config(path, &config)?;
        info!("salt generated automatically");
    }

    Ok(config)
}

/// Read and atomically persist the current salt.
pub trait SaltStore: Send + Sync {
    fn current_salt(&self) -> Result<String, ConfigError>;
    fn persist_salt(&self, salt: &str) -> Result<(), ConfigError>;
}

/// Salt store backed by the JSON config file; other fields are preserved.
pub struct FileSaltStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSaltStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl SaltStore for FileSaltStore {
    fn current_salt(&self) -> Result<String, ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let config = read_config(&self.path)?;
        if config.salt.is_empty() {
            return Err(ConfigError::MissingSalt);
        }
        Ok(config.salt)
    }

    fn persist_salt(&self, salt: &str) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = read_config(&self.path)?;
        config.salt = salt.to_string();
        save_config(&self.path, &config)
    }
}
