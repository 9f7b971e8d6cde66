//! Audit-store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowtrail_types::{AuditEvent, OffsetRecord, StagingBatch, StagingSummary};

use crate::error::Result;

/// Storage contract for the audit pipeline.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn AuditStore>`. All mutation of the audit store goes through
/// this trait; the commit pipeline owns the ordering of calls.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Create indexes the pipeline depends on: the staging status
    /// index and the staging TTL. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn prepare(&self) -> Result<()>;

    /// Read the offset record for a source. `Ok(None)` when no commit
    /// has ever recorded a position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn load_offset(&self, source: &str) -> Result<Option<OffsetRecord>>;

    /// Insert a pending staging batch. The batch id must be fresh;
    /// a collision is a terminal error, never absorbed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn stage_batch(&self, batch: &StagingBatch) -> Result<()>;

    /// Write the events and advance the offset in one multi-document
    /// transaction. Duplicate event ids are absorbed; any other write
    /// error aborts the transaction, leaving both collections
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionsUnsupported`](crate::StoreError) when
    /// the deployment cannot run transactions; other variants on
    /// storage failure.
    async fn commit_atomic(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()>;

    /// Non-atomic fallback: bulk-write the events (duplicates
    /// absorbed), then upsert the offset. A crash between the two
    /// leaves the offset behind the events; the next run replays the
    /// gap and the duplicate ids absorb it, so the guarantee weakens
    /// to at-least-once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn commit_unordered(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()>;

    /// Mark a staging batch committed. Matching no document is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn mark_committed(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Enumerate pending staging batches for a source, oldest first,
    /// without their event payloads.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn pending_batches(&self, source: &str) -> Result<Vec<StagingSummary>>;

    /// Mark a staging batch archived.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    async fn archive_batch(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Release the underlying client. Called once at shutdown.
    async fn close(&self);
}
