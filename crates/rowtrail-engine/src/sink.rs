//! The commit pipeline against the audit store.
//!
//! Commit protocol, per attempt:
//!   1. insert a pending staging batch under a fresh batch id,
//!   2. write the events and advance the offset atomically (or via the
//!      documented non-atomic fallback when the store cannot run
//!      transactions),
//!   3. best-effort: mark the staging batch committed.
//!
//! The batch id is regenerated on every retry, so a staging insert is
//! never replayed onto an existing document; abandoned pending batches
//! are archived by the next run's recovery and expire with the staging
//! TTL. Idempotency across attempts comes from the deterministic event
//! ids and the offset upsert.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rowtrail_store::{AuditStore, StoreError};
use rowtrail_types::{AuditEvent, BatchStatus, OffsetRecord, SourcePosition, StagingBatch};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::retry::{RetryError, RetryPolicy};

/// Failures surfaced by [`Sink`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The retry budget ran out on transient errors. The staged batch
    /// stays pending for the next run's recovery.
    #[error("audit store unavailable after {attempts} attempts: {last}")]
    Unavailable {
        attempts: u32,
        #[source]
        last: StoreError,
    },

    /// The operation was cancelled by shutdown.
    #[error("store operation cancelled")]
    Cancelled,

    /// A non-retryable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SinkError {
    fn from_retry(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { attempts, last } => Self::Unavailable { attempts, last },
            RetryError::Terminal(err) => Self::Store(err),
        }
    }
}

/// Single-writer façade over the audit store for one source.
pub struct Sink {
    store: Arc<dyn AuditStore>,
    source: String,
    retry: RetryPolicy,
    fallback_warned: AtomicBool,
    batch_clock: AtomicI64,
    committed: watch::Sender<Option<String>>,
}

impl Sink {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, source: impl Into<String>) -> Self {
        let (committed, _) = watch::channel(None);
        Self {
            store,
            source: source.into(),
            retry: RetryPolicy::default(),
            fallback_warned: AtomicBool::new(false),
            batch_clock: AtomicI64::new(0),
            committed,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Source id this sink writes for.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Position tokens of successfully committed batches, for the
    /// reader to acknowledge against the source.
    #[must_use]
    pub fn commit_feed(&self) -> watch::Receiver<Option<String>> {
        self.committed.subscribe()
    }

    /// Whether any commit has used the non-atomic fallback.
    #[must_use]
    pub fn fallback_engaged(&self) -> bool {
        self.fallback_warned.load(Ordering::Relaxed)
    }

    /// Monotonic nanosecond stamp for batch ids: never repeats within
    /// a process even if the wall clock stalls.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        let previous = self
            .batch_clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(if now > prev { now } else { prev + 1 })
            })
            .unwrap_or(now);
        if now > previous {
            now
        } else {
            previous + 1
        }
    }

    fn next_batch_id(&self, token: &str) -> String {
        format!("{}_{}_{}", self.source, self.next_stamp(), token)
    }

    /// Read the offset record for this source, retrying transient
    /// failures.
    ///
    /// # Errors
    ///
    /// [`SinkError::Unavailable`] after the retry budget; other
    /// variants as classified by the store.
    pub async fn load_offset(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OffsetRecord>, SinkError> {
        self.retry
            .run(cancel, || self.store.load_offset(&self.source))
            .await
            .map_err(SinkError::from_retry)
    }

    /// Commit a batch together with its terminal position. Empty
    /// batches are a no-op.
    ///
    /// # Errors
    ///
    /// [`SinkError::Unavailable`] once retries are exhausted; the
    /// staged attempt stays pending and the offset does not move.
    pub async fn commit(
        &self,
        events: &[AuditEvent],
        position: &SourcePosition,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        self.retry
            .run(cancel, || self.commit_once(events, position))
            .await
            .map_err(SinkError::from_retry)?;
        self.committed.send_replace(Some(position.token.clone()));
        Ok(())
    }

    /// One full commit attempt: stage, apply, mark.
    async fn commit_once(
        &self,
        events: &[AuditEvent],
        position: &SourcePosition,
    ) -> Result<(), StoreError> {
        let batch_id = self.next_batch_id(&position.token);
        let staged = StagingBatch {
            batch_id: batch_id.clone(),
            events: events.to_vec(),
            source: self.source.clone(),
            token: position.token.clone(),
            file: position.file.clone(),
            pos: position.pos,
            created_at: Utc::now(),
            status: BatchStatus::Pending,
            committed_at: None,
            archived_at: None,
        };
        self.store.stage_batch(&staged).await?;

        let offset = OffsetRecord::new(&self.source, position, Utc::now());
        self.apply(events, &offset).await?;

        // Best-effort: a missing mark is a stale pending document that
        // recovery archives without replay.
        if let Err(err) = self.store.mark_committed(&batch_id, Utc::now()).await {
            tracing::warn!(
                batch_id,
                error = %err,
                "failed to mark staging batch committed; recovery will archive it"
            );
        }

        tracing::info!(
            batch_id,
            events = events.len(),
            position = %position,
            "batch committed"
        );
        Ok(())
    }

    async fn apply(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<(), StoreError> {
        match self.store.commit_atomic(events, offset).await {
            Err(err) if err.is_transactions_unsupported() => {
                if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        error = %err,
                        "audit store cannot run multi-document transactions; \
                         using non-atomic writes (at-least-once with idempotent replay)"
                    );
                }
                self.store.commit_unordered(events, offset).await
            }
            outcome => outcome,
        }
    }

    /// Reconcile the staging collection: archive every pending batch
    /// for this source. No re-commit is attempted; either the offset
    /// never advanced (the source replays and the duplicate ids
    /// absorb), or the batch already landed. Must complete before the
    /// reader starts.
    ///
    /// # Errors
    ///
    /// Any store failure aborts startup.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<u64, SinkError> {
        let pending = self
            .retry
            .run(cancel, || self.store.pending_batches(&self.source))
            .await
            .map_err(SinkError::from_retry)?;

        let mut archived = 0u64;
        for batch in &pending {
            tracing::info!(
                batch_id = %batch.batch_id,
                token = %batch.token,
                created_at = %batch.created_at,
                "archiving stale pending batch"
            );
            self.retry
                .run(cancel, || self.store.archive_batch(&batch.batch_id, Utc::now()))
                .await
                .map_err(SinkError::from_retry)?;
            archived += 1;
        }

        if archived > 0 {
            tracing::info!(archived, "recovery archived stale pending batches");
        } else {
            tracing::debug!("no pending staging batches to recover");
        }
        Ok(archived)
    }
}
