//! Eventually consistent read cache over the remote row store.
//!
//! Readers receive an `Arc<Snapshot>` that never changes underneath them. A
//! refresh builds the next snapshot without holding any lock and then swaps
//! the pointer, so the write lock is held only for the swap. Writes go
//! straight to the remote store and become visible after the next refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::store::{RowStore, SecretRecord, Sheet, StoreError, KEY_CELL};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// A complete secret row together with its position in the remote sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSecret {
    /// Remote row index at fetch time; incomplete rows are skipped but still
    /// counted, so this is the index `delete` expects.
    pub row: usize,
    pub record: SecretRecord,
}

/// Point-in-time copy of both sheets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub secrets: Vec<CachedSecret>,
    /// Text-encoded wrapped private key, if one has been established.
    pub key: Option<String>,
}

pub struct CachedSecretStore {
    remote: Arc<dyn RowStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_failures: AtomicU64,
}

impl CachedSecretStore {
    /// Creates a cache with an empty snapshot; nothing is fetched yet.
    pub fn new(remote: Arc<dyn RowStore>) -> Self {
        Self {
            remote,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_failures: AtomicU64::new(0),
        }
    }

    /// Creates the cache and performs the initial fetch, which must succeed.
    pub async fn connect(remote: Arc<dyn RowStore>) -> Result<Self, StoreError> {
        let cache = Self::new(remote);
        cache.refresh().await?;
        Ok(cache)
    }

    async fn fetch(&self) -> Result<Snapshot, StoreError> {
        let secrets = self
            .remote
            .read_all(Sheet::Secrets)
            .await?
            .iter()
            .enumerate()
            .filter_map(|(row, cells)| {
                SecretRecord::from_row(cells).map(|record| CachedSecret { row, record })
            })
            .collect();
        let key = self
            .remote
            .read_all(Sheet::Keys)
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .filter(|key| !key.trim().is_empty());
        Ok(Snapshot { secrets, key })
    }

    /// Fetches the full remote state and swaps it in. On failure the previous
    /// snapshot stays in place and the error is returned for reporting.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        match self.fetch().await {
            Ok(next) => {
                let rows = next.secrets.len();
                let next = Arc::new(next);
                *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next;
                debug!(rows, "cache snapshot replaced");
                Ok(())
            }
            Err(err) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "unable to refresh tables, keeping previous snapshot");
                Err(err)
            }
        }
    }

    /// Current snapshot. Never waits on network I/O.
    pub fn get(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Refresh cycles that failed since startup.
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub async fn append(&self, record: &SecretRecord) -> Result<(), StoreError> {
        self.remote
            .append_row(Sheet::Secrets, record.to_row())
            .await
            .map_err(|err| {
                error!(error = %err, sheet = Sheet::Secrets.title(), "unable to append row");
                err
            })
    }

    /// Deletes by remote row position ([`CachedSecret::row`]). Positions are
    /// only meaningful against the latest listing.
    pub async fn delete(&self, index: usize) -> Result<(), StoreError> {
        self.remote
            .delete_row(Sheet::Secrets, index)
            .await
            .map_err(|err| {
                error!(error = %err, index, "unable to delete row");
                err
            })
    }

    /// Overwrites the wrapped key record.
    pub async fn set_key(&self, record: &str) -> Result<(), StoreError> {
        self.remote
            .update_cell(Sheet::Keys, KEY_CELL, record.to_string())
            .await
            .map_err(|err| {
                error!(error = %err, sheet = Sheet::Keys.title(), "unable to store wrapped key");
                err
            })
    }
}

/// When the background task refreshes the cache.
pub enum RefreshSchedule {
    Interval(Duration),
    /// Refresh only when a [`ManualTrigger`] fires.
    Manual(mpsc::Receiver<oneshot::Sender<()>>),
}

impl RefreshSchedule {
    pub fn manual() -> (Self, ManualTrigger) {
        let (tx, rx) = mpsc::channel(1);
        (Self::Manual(rx), ManualTrigger { tx })
    }
}

#[derive(Clone)]
pub struct ManualTrigger {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl ManualTrigger {
    /// Requests one refresh cycle and waits for it to finish. Returns `false`
    /// once the task is gone.
    pub async fn fire(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(done_tx).await.is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }
}

/// Handle to the background refresh loop.
pub struct RefreshTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    pub fn spawn(cache: Arc<CachedSecretStore>, schedule: RefreshSchedule) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(cache, schedule, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stops scheduling cycles and waits for the loop to exit. A refresh that
    /// is already running completes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "cache refresh task ended abnormally");
        }
    }
}

async fn run_refresh_loop(
    cache: Arc<CachedSecretStore>,
    schedule: RefreshSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    match schedule {
        RefreshSchedule::Interval(period) => {
            info!(interval_secs = period.as_secs(), "cache refresh task started");
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        // Failures are logged by refresh; the next tick retries.
                        let _ = cache.refresh().await;
                    }
                }
            }
        }
        RefreshSchedule::Manual(mut requests) => loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                request = requests.recv() => match request {
                    Some(done) => {
                        let _ = cache.refresh().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
            }
        },
    }
    info!("cache refresh task stopped");
}
