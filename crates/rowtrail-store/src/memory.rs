//! In-memory implementation of [`AuditStore`].
//!
//! Mirrors the MongoDB backend's observable semantics, including
//! duplicate-id absorption and the standalone (no transactions) mode.
//! Used by the engine's tests and useful for local experiments; the
//! read accessors exist so tests can assert on stored state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowtrail_types::{AuditEvent, BatchStatus, OffsetRecord, StagingBatch, StagingSummary};

use crate::error::{Result, StoreError};
use crate::store::AuditStore;

#[derive(Default)]
struct Inner {
    events: BTreeMap<String, AuditEvent>,
    offsets: HashMap<String, OffsetRecord>,
    staging: BTreeMap<String, StagingBatch>,
}

/// In-memory audit store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    transactions: bool,
    duplicates_absorbed: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that supports atomic commits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            transactions: true,
            duplicates_absorbed: AtomicU64::new(0),
        }
    }

    /// A store that rejects `commit_atomic`, simulating a standalone
    /// deployment without transaction support.
    #[must_use]
    pub fn standalone() -> Self {
        Self {
            transactions: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn apply(&self, inner: &mut Inner, events: &[AuditEvent], offset: &OffsetRecord) {
        for event in events {
            if inner.events.contains_key(&event.id) {
                self.duplicates_absorbed.fetch_add(1, Ordering::Relaxed);
            } else {
                inner.events.insert(event.id.clone(), event.clone());
            }
        }
        inner.offsets.insert(offset.source.clone(), offset.clone());
    }

    /// Number of event documents stored.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.lock().map(|inner| inner.events.len()).unwrap_or(0)
    }

    /// Fetch one event by id.
    #[must_use]
    pub fn event(&self, id: &str) -> Option<AuditEvent> {
        self.lock().ok().and_then(|inner| inner.events.get(id).cloned())
    }

    /// All stored events in id order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock()
            .map(|inner| inner.events.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current offset record for a source.
    #[must_use]
    pub fn offset(&self, source: &str) -> Option<OffsetRecord> {
        self.lock()
            .ok()
            .and_then(|inner| inner.offsets.get(source).cloned())
    }

    /// All staging batches in id order.
    #[must_use]
    pub fn staging_batches(&self) -> Vec<StagingBatch> {
        self.lock()
            .map(|inner| inner.staging.values().cloned().collect())
            .unwrap_or_default()
    }

    /// How many duplicate event inserts have been absorbed.
    #[must_use]
    pub fn duplicates_absorbed(&self) -> u64 {
        self.duplicates_absorbed.load(Ordering::Relaxed)
    }

    /// Seed events directly, bypassing the commit protocol. Test setup
    /// helper.
    pub fn seed_events(&self, events: &[AuditEvent]) {
        if let Ok(mut inner) = self.lock() {
            for event in events {
                inner.events.insert(event.id.clone(), event.clone());
            }
        }
    }

    /// Seed an offset record directly. Test setup helper.
    pub fn seed_offset(&self, offset: OffsetRecord) {
        if let Ok(mut inner) = self.lock() {
            inner.offsets.insert(offset.source.clone(), offset);
        }
    }

    /// Seed a staging batch directly. Test setup helper.
    pub fn seed_staging(&self, batch: StagingBatch) {
        if let Ok(mut inner) = self.lock() {
            inner.staging.insert(batch.batch_id.clone(), batch);
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn load_offset(&self, source: &str) -> Result<Option<OffsetRecord>> {
        Ok(self.lock()?.offsets.get(source).cloned())
    }

    async fn stage_batch(&self, batch: &StagingBatch) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.staging.contains_key(&batch.batch_id) {
            return Err(StoreError::Rejected(format!(
                "duplicate staging batch id {}",
                batch.batch_id
            )));
        }
        inner.staging.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn commit_atomic(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()> {
        if !self.transactions {
            return Err(StoreError::TransactionsUnsupported(
                "Transaction numbers are only allowed on a replica set member or mongos".into(),
            ));
        }
        let mut inner = self.lock()?;
        self.apply(&mut inner, events, offset);
        Ok(())
    }

    async fn commit_unordered(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()> {
        let mut inner = self.lock()?;
        self.apply(&mut inner, events, offset);
        Ok(())
    }

    async fn mark_committed(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(batch) = inner.staging.get_mut(batch_id) {
            batch.status = BatchStatus::Committed;
            batch.committed_at = Some(at);
        }
        Ok(())
    }

    async fn pending_batches(&self, source: &str) -> Result<Vec<StagingSummary>> {
        let inner = self.lock()?;
        let mut pending: Vec<_> = inner
            .staging
            .values()
            .filter(|batch| batch.status == BatchStatus::Pending && batch.source == source)
            .map(StagingBatch::summary)
            .collect();
        pending.sort_by_key(|summary| summary.created_at);
        Ok(pending)
    }

    async fn archive_batch(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(batch) = inner.staging.get_mut(batch_id) {
            batch.status = BatchStatus::Archived;
            batch.archived_at = Some(at);
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rowtrail_types::{EventMeta, LogPosition, OpKind, SourcePosition, SourceRef};
    use serde_json::Value;

    const SOURCE: &str = "postgres://127.0.0.1:5432";

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, second).unwrap()
    }

    fn event(id: &str) -> AuditEvent {
        AuditEvent {
            id: id.into(),
            ts: at(0),
            op: OpKind::Insert,
            meta: EventMeta {
                db: "app".into(),
                tbl: "users".into(),
                pk: Value::from(1),
            },
            chg: Default::default(),
            src: SourceRef {
                binlog: LogPosition {
                    file: "f".into(),
                    pos: 1,
                },
                gtid: "0/1".into(),
            },
            ts_display: String::new(),
        }
    }

    fn offset(token: &str) -> OffsetRecord {
        OffsetRecord::new(SOURCE, &SourcePosition::new("f", 1, token), at(0))
    }

    fn pending(batch_id: &str, second: u32) -> StagingBatch {
        StagingBatch {
            batch_id: batch_id.into(),
            events: vec![event(batch_id)],
            source: SOURCE.into(),
            token: "0/1".into(),
            file: "f".into(),
            pos: 1,
            created_at: at(second),
            status: BatchStatus::Pending,
            committed_at: None,
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn commit_absorbs_duplicate_ids() {
        let store = MemoryStore::new();
        store
            .commit_atomic(&[event("a"), event("b")], &offset("0/1"))
            .await
            .unwrap();
        store
            .commit_atomic(&[event("b"), event("c")], &offset("0/2"))
            .await
            .unwrap();

        assert_eq!(store.event_count(), 3);
        assert_eq!(store.duplicates_absorbed(), 1);
        assert_eq!(store.offset(SOURCE).unwrap().token, "0/2");
    }

    #[tokio::test]
    async fn standalone_rejects_atomic_commit_but_allows_fallback() {
        let store = MemoryStore::standalone();
        let err = store
            .commit_atomic(&[event("a")], &offset("0/1"))
            .await
            .unwrap_err();
        assert!(err.is_transactions_unsupported());
        assert_eq!(store.event_count(), 0);

        store
            .commit_unordered(&[event("a")], &offset("0/1"))
            .await
            .unwrap();
        assert_eq!(store.event_count(), 1);
        assert_eq!(store.offset(SOURCE).unwrap().token, "0/1");
    }

    #[tokio::test]
    async fn staging_id_collision_is_rejected() {
        let store = MemoryStore::new();
        store.stage_batch(&pending("b1", 0)).await.unwrap();
        let err = store.stage_batch(&pending("b1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn pending_enumeration_filters_status_and_source_in_age_order() {
        let store = MemoryStore::new();
        store.stage_batch(&pending("young", 5)).await.unwrap();
        store.stage_batch(&pending("old", 1)).await.unwrap();
        store.stage_batch(&pending("done", 2)).await.unwrap();
        store.mark_committed("done", at(3)).await.unwrap();

        let mut foreign = pending("foreign", 0);
        foreign.source = "postgres://elsewhere:5432".into();
        store.stage_batch(&foreign).await.unwrap();

        let pending = store.pending_batches(SOURCE).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.batch_id.as_str()).collect();
        assert_eq!(ids, ["old", "young"]);
    }

    #[tokio::test]
    async fn archive_sets_status_and_timestamp() {
        let store = MemoryStore::new();
        store.stage_batch(&pending("b1", 0)).await.unwrap();
        store.archive_batch("b1", at(9)).await.unwrap();

        let batches = store.staging_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchStatus::Archived);
        assert_eq!(batches[0].archived_at, Some(at(9)));
        assert!(store.pending_batches(SOURCE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_on_missing_batch_is_a_no_op() {
        let store = MemoryStore::new();
        store.mark_committed("missing", at(0)).await.unwrap();
        assert!(store.staging_batches().is_empty());
    }
}
