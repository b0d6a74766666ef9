//! Row-store abstraction over the remote backing service.
//!
//! The store exposes two sheets: `Secrets`, one row per credential
//! (description, username envelope, secret envelope), and `Keys`, whose
//! first cell holds the wrapped private key. Every call is fallible and is
//! attempted exactly once.

pub mod json_file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json_file::JsonFileStore;
pub use memory::MemoryRowStore;

/// Cell holding the wrapped private key in the `Keys` sheet.
pub const KEY_CELL: &str = "A1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sheet {
    Secrets,
    Keys,
}

impl Sheet {
    pub fn title(&self) -> &'static str {
        match self {
            Sheet::Secrets => "Secrets",
            Sheet::Keys => "Keys",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("row {index} out of range for sheet {sheet} with {len} rows")]
    IndexOutOfRange {
        sheet: &'static str,
        index: usize,
        len: usize,
    },
    #[error("invalid cell reference: {0}")]
    InvalidCell(String),
    #[error("malformed store data: {0}")]
    Malformed(String),
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One stored credential. Only `description` is plaintext; `username` and
/// `secret` are text-encoded hybrid envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub description: String,
    pub username: String,
    pub secret: String,
}

impl SecretRecord {
    /// Rows with fewer than three cells are incomplete and yield `None`.
    pub fn from_row(row: &[String]) -> Option<Self> {
        match row {
            [description, username, secret, ..] => Some(Self {
                description: description.clone(),
                username: username.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.description.clone(),
            self.username.clone(),
            self.secret.clone(),
        ]
    }
}

/// Zero-based position parsed from an A1-style reference such as `C12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: usize,
    pub column: usize,
}

impl CellRef {
    pub fn parse(reference: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidCell(reference.to_string());
        let split = reference
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (letters, digits) = reference.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(invalid());
        }

        let column = letters
            .bytes()
            .try_fold(0usize, |acc, b| {
                acc.checked_mul(26)?.checked_add(usize::from(b - b'A') + 1)
            })
            .ok_or_else(invalid)?
            - 1;
        let row: usize = digits.parse().map_err(|_| invalid())?;
        if row == 0 {
            return Err(invalid());
        }
        Ok(Self {
            row: row - 1,
            column,
        })
    }
}

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Vec<String>>, StoreError>;
    async fn append_row(&self, sheet: Sheet, values: Vec<String>) -> Result<(), StoreError>;
    /// Removes row `index`; later rows shift down by one.
    async fn delete_row(&self, sheet: Sheet, index: usize) -> Result<(), StoreError>;
    async fn update_cell(&self, sheet: Sheet, cell: &str, value: String) -> Result<(), StoreError>;
}
