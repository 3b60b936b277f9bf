//! In-process staging store for dry runs and tests.
//!
//! Mirrors the staging table's `ON CONFLICT (ticker, dt) DO NOTHING`
//! contract and keeps per-connection transactions, so commit-policy
//! behaviour can be observed without a database server.

use super::{StagingStore, StoreConnector, StoreError};
use crate::domain::PriceRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (String, DateTime<Utc>);

#[derive(Debug, Default)]
struct Shared {
    committed: BTreeMap<Key, PriceRecord>,
    scripts: Vec<String>,
    commits: usize,
}

/// Handle to an in-memory staging table. Clones share the same table.
///
/// As a `StoreConnector` every `connect` returns a fresh connection onto the
/// shared table; as a `StagingStore` the handle itself is one connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStagingStore {
    shared: Arc<Mutex<Shared>>,
    pending: Option<BTreeMap<Key, PriceRecord>>,
    closed: bool,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Committed rows, ordered by `(ticker, dt)`.
    pub fn rows(&self) -> Vec<PriceRecord> {
        self.lock().committed.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed row count for one ticker symbol.
    pub fn count_for(&self, ticker: &str) -> usize {
        self.lock()
            .committed
            .keys()
            .filter(|(t, _)| t == ticker)
            .count()
    }

    /// Scripts executed through any connection, in order.
    pub fn executed_scripts(&self) -> Vec<String> {
        self.lock().scripts.clone()
    }

    /// Number of successful commits across all connections.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(StoreError::Rejected("transaction already in progress".into()));
        }
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    async fn insert_ignore(&mut self, records: &[PriceRecord]) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        let mut inserted = 0;

        match self.pending.as_mut() {
            Some(pending) => {
                for record in records {
                    let key = record.key();
                    if !shared.committed.contains_key(&key) && !pending.contains_key(&key) {
                        pending.insert(key, record.clone());
                        inserted += 1;
                    }
                }
            }
            None => {
                for record in records {
                    let key = record.key();
                    if !shared.committed.contains_key(&key) {
                        shared.committed.insert(key, record.clone());
                        inserted += 1;
                    }
                }
                if inserted > 0 {
                    shared.commits += 1;
                }
            }
        }

        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| StoreError::Rejected("no transaction in progress".into()))?;

        let mut shared = self.lock();
        for (key, record) in pending {
            // First committer wins, as with ON CONFLICT DO NOTHING.
            shared.committed.entry(key).or_insert(record);
        }
        shared.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.pending
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Rejected("no transaction in progress".into()))
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.lock().scripts.push(sql.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        // Uncommitted work is discarded, like a dropped session.
        self.pending = None;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MemoryStagingStore {
    fn describe(&self) -> String {
        "in-memory staging table".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn StagingStore>, StoreError> {
        Ok(Box::new(MemoryStagingStore {
            shared: Arc::clone(&self.shared),
            pending: None,
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Ticker;
    use chrono::TimeZone;

    fn record(ticker: &str, day: u32, close: f64) -> PriceRecord {
        PriceRecord {
            ticker: Ticker::new(ticker).unwrap(),
            dt: Utc.with_ymd_and_hms(2024, 1, day, 5, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            dividends: 0.0,
            stock_splits: 0.0,
        }
    }

    #[tokio::test]
    async fn conflicting_rows_are_ignored_not_updated() {
        let mut store = MemoryStagingStore::new();
        let first = store.insert_ignore(&[record("^GSPC", 2, 10.0)]).await.unwrap();
        let second = store
            .insert_ignore(&[record("^GSPC", 2, 99.0), record("^GSPC", 3, 11.0)])
            .await
            .unwrap();

        assert_eq!((first, second), (1, 1));
        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].close, 10.0, "existing row must not be updated");
    }

    #[tokio::test]
    async fn rows_are_invisible_until_commit() {
        let handle = MemoryStagingStore::new();
        let mut conn = handle.connect().await.unwrap();

        conn.begin().await.unwrap();
        assert_eq!(conn.insert_ignore(&[record("^DJI", 2, 1.0)]).await.unwrap(), 1);
        assert!(handle.is_empty());

        conn.commit().await.unwrap();
        assert_eq!(handle.count_for("^DJI"), 1);
        assert_eq!(handle.commit_count(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_pending_rows() {
        let handle = MemoryStagingStore::new();
        let mut conn = handle.connect().await.unwrap();

        conn.begin().await.unwrap();
        conn.insert_ignore(&[record("^DJI", 2, 1.0)]).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(handle.is_empty());
        assert!(matches!(conn.commit().await, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn duplicates_within_one_transaction_count_once() {
        let mut store = MemoryStagingStore::new();
        store.begin().await.unwrap();
        let n = store
            .insert_ignore(&[record("^IXIC", 2, 1.0), record("^IXIC", 2, 2.0)])
            .await
            .unwrap();
        store.commit().await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn closed_connection_refuses_work() {
        let mut store = MemoryStagingStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.insert_ignore(&[record("^DJI", 2, 1.0)]).await,
            Err(StoreError::Closed)
        ));
    }
}
