//! Local JSON-file backing store for single-host deployments.
//!
//! The file holds `{ "secrets": [...], "key": "..." }`. Writes are
//! read-modify-write cycles serialized by an async mutex, and each one
//! replaces the file atomically so the wrapped key is never half written.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CellRef, RowStore, SecretRecord, Sheet, StoreError};
use crate::config::replace_file;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSheets {
    #[serde(default)]
    secrets: Vec<SecretRecord>,
    #[serde(default)]
    key: String,
}

pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store, creating the file and its parent directory on first use.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if tokio::fs::metadata(&path).await.is_err() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, b"").await?;
            info!(path = %path.display(), "created JSON storage file");
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StoredSheets, StoreError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(StoredSheets::default());
        }
        serde_json::from_str(&raw).map_err(|e| StoreError::Malformed(format!("{e}")))
    }

    async fn save(&self, sheets: &StoredSheets) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_vec_pretty(sheets).map_err(|e| StoreError::Malformed(format!("{e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || replace_file(&path, &encoded))
            .await
            .map_err(|e| StoreError::Unavailable(format!("storage write task failed: {e}")))??;
        debug!(path = %self.path.display(), rows = sheets.secrets.len(), "storage file written");
        Ok(())
    }
}

#[async_trait]
impl RowStore for JsonFileStore {
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Vec<String>>, StoreError> {
        let sheets = {
            let _guard = self.lock.lock().await;
            self.load().await?
        };
        Ok(match sheet {
            Sheet::Secrets => sheets.secrets.iter().map(SecretRecord::to_row).collect(),
            Sheet::Keys if sheets.key.is_empty() => Vec::new(),
            Sheet::Keys => vec![vec![sheets.key]],
        })
    }

    async fn append_row(&self, sheet: Sheet, values: Vec<String>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut sheets = self.load().await?;
        match sheet {
            Sheet::Secrets => {
                let record = SecretRecord::from_row(&values).ok_or_else(|| {
                    StoreError::Malformed(format!("secret rows need 3 cells, got {}", values.len()))
                })?;
                sheets.secrets.push(record);
            }
            Sheet::Keys => {
                return Err(StoreError::Malformed(
                    "the key sheet holds a single cell; update it instead".to_string(),
                ));
            }
        }
        self.save(&sheets).await
    }

    async fn delete_row(&self, sheet: Sheet, index: usize) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut sheets = self.load().await?;
        let len = match sheet {
            Sheet::Secrets => sheets.secrets.len(),
            Sheet::Keys => usize::from(!sheets.key.is_empty()),
        };
        if index >= len {
            return Err(StoreError::IndexOutOfRange {
                sheet: sheet.title(),
                index,
                len,
            });
        }
        match sheet {
            Sheet::Secrets => {
                sheets.secrets.remove(index);
            }
            Sheet::Keys => sheets.key.clear(),
        }
        self.save(&sheets).await
    }

    async fn update_cell(&self, sheet: Sheet, cell: &str, value: String) -> Result<(), StoreError> {
        let cell = CellRef::parse(cell)?;
        let _guard = self.lock.lock().await;
        let mut sheets = self.load().await?;
        match sheet {
            Sheet::Keys if cell.row == 0 && cell.column == 0 => sheets.key = value,
            Sheet::Keys => {
                return Err(StoreError::Malformed(
                    "the key sheet only has cell A1".to_string(),
                ));
            }
            Sheet::Secrets => {
                let len = sheets.secrets.len();
                let record = sheets.secrets.get_mut(cell.row).ok_or(StoreError::IndexOutOfRange {
                    sheet: sheet.title(),
                    index: cell.row,
                    len,
                })?;
                match cell.column {
                    0 => record.description = value,
                    1 => record.username = value,
                    2 => record.secret = value,
                    other => {
                        return Err(StoreError::Malformed(format!(
                            "secret rows have 3 columns, got column {}",
                            other + 1
                        )));
                    }
                }
            }
        }
        self.save(&sheets).await
    }
}
