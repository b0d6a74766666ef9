//! In-process row store. Useful for embedding and for exercising the cache
//! and custodian against injected remote failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CellRef, RowStore, Sheet, StoreError};

#[derive(Default)]
pub struct MemoryRowStore {
    sheets: Mutex<HashMap<Sheet, Vec<Vec<String>>>>,
    fail_reads: AtomicBool,
    fail_key_writes: AtomicBool,
    fail_secret_writes: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_failure(&self, sheet: Sheet, fail: bool) {
        match sheet {
            Sheet::Keys => self.fail_key_writes.store(fail, Ordering::SeqCst),
            Sheet::Secrets => self.fail_secret_writes.store(fail, Ordering::SeqCst),
        }
    }

    /// Number of `read_all` calls served so far, failed ones included.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn sheets(&self) -> MutexGuard<'_, HashMap<Sheet, Vec<Vec<String>>>> {
        self.sheets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self, sheet: Sheet) -> Result<(), StoreError> {
        let failing = match sheet {
            Sheet::Keys => self.fail_key_writes.load(Ordering::SeqCst),
            Sheet::Secrets => self.fail_secret_writes.load(Ordering::SeqCst),
        };
        if failing {
            return Err(StoreError::Unavailable(format!(
                "injected write failure on {}",
                sheet.title()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Vec<String>>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(self.sheets().get(&sheet).cloned().unwrap_or_default())
    }

    async fn append_row(&self, sheet: Sheet, values: Vec<String>) -> Result<(), StoreError> {
        self.check_write(sheet)?;
        self.sheets().entry(sheet).or_default().push(values);
        Ok(())
    }

    async fn delete_row(&self, sheet: Sheet, index: usize) -> Result<(), StoreError> {
        self.check_write(sheet)?;
        let mut sheets = self.sheets();
        let rows = sheets.entry(sheet).or_default();
        if index >= rows.len() {
            return Err(StoreError::IndexOutOfRange {
                sheet: sheet.title(),
                index,
                len: rows.len(),
            });
        }
        rows.remove(index);
        Ok(())
    }

    async fn update_cell(&self, sheet: Sheet, cell: &str, value: String) -> Result<(), StoreError> {
        self.check_write(sheet)?;
        let cell = CellRef::parse(cell)?;
        let mut sheets = self.sheets();
        let rows = sheets.entry(sheet).or_default();
        if rows.len() <= cell.row {
            rows.resize_with(cell.row + 1, Vec::new);
        }
        let row = &mut rows[cell.row];
        if row.len() <= cell.column {
            row.resize(cell.column + 1, String::new());
        }
        row[cell.column] = value;
        Ok(())
    }
}
