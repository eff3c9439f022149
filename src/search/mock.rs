//! In-memory search index for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Result, SearchError, SearchIndex};
use crate::config::WriteMode;
use crate::order::{OrderId, ProcessedRecord};

/// In-memory index with failure injection.
#[derive(Default)]
pub struct InMemoryIndex {
    records: Mutex<Vec<ProcessedRecord>>,
    write_mode: WriteMode,
    created: AtomicBool,
    fail_on_ensure: AtomicBool,
    /// Number of upcoming writes that fail.
    failing_writes: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_mode(write_mode: WriteMode) -> Self {
        Self {
            write_mode,
            ..Self::default()
        }
    }

    pub fn set_fail_on_ensure(&self, fail: bool) {
        self.fail_on_ensure.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay each write before it is applied.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<ProcessedRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of documents recorded for `order_id`.
    pub fn count_for(&self, order_id: &OrderId) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| &r.order_id == order_id)
            .count()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn ensure_index(&self) -> Result<()> {
        if self.fail_on_ensure.load(Ordering::SeqCst) {
            return Err(SearchError::UnexpectedStatus {
                operation: "indices.exists",
                status: 500,
            });
        }
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, record: &ProcessedRecord) -> Result<()> {
        let delay = *self.write_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SearchError::UnexpectedStatus {
                operation: "index",
                status: 503,
            });
        }

        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if self.write_mode == WriteMode::Upsert {
            records.retain(|r| r.order_id != record.order_id);
        }
        records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> ProcessedRecord {
        ProcessedRecord::processed(OrderId::new(id), Utc::now())
    }

    #[tokio::test]
    async fn test_insert_mode_keeps_duplicates() {
        let index = InMemoryIndex::new();

        index.write(&record("X")).await.unwrap();
        index.write(&record("X")).await.unwrap();

        assert_eq!(index.count_for(&OrderId::new("X")), 2);
    }

    #[tokio::test]
    async fn test_upsert_mode_replaces() {
        let index = InMemoryIndex::with_write_mode(WriteMode::Upsert);

        index.write(&record("X")).await.unwrap();
        index.write(&record("X")).await.unwrap();

        assert_eq!(index.count_for(&OrderId::new("X")), 1);
    }

    #[tokio::test]
    async fn test_fail_next_writes_counts_down() {
        let index = InMemoryIndex::new();
        index.fail_next_writes(1);

        assert!(index.write(&record("X")).await.is_err());
        assert!(index.write(&record("X")).await.is_ok());
        assert_eq!(index.records().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_index() {
        let index = InMemoryIndex::new();
        index.ensure_index().await.unwrap();
        assert!(index.is_created());

        let failing = InMemoryIndex::new();
        failing.set_fail_on_ensure(true);
        assert!(failing.ensure_index().await.is_err());
        assert!(!failing.is_created());
    }
}
