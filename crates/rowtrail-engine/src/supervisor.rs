//! Lifecycle supervisor: recovery, offset resumption, the reader task,
//! and cooperative shutdown.
//!
//! Startup order is fixed: prepare the store, reconcile staging,
//! load the offset, then attach the reader. On a termination signal
//! the reader is stopped first, the in-memory batch is flushed under a
//! bounded deadline, and the store is closed; a flush failure is
//! logged, not propagated, because the next run's recovery observes
//! it. A reader error ends the process with a nonzero status.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rowtrail_reader::{ReplicationReader, ResumeFrom};
use rowtrail_store::AuditStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::handler::{Handler, SharedHandler};
use crate::sink::Sink;

/// Default bound on the shutdown flush.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the reader task gets to observe cancellation before it is
/// aborted.
const READER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Owns the sink, the handler, and the reader task.
pub struct Supervisor {
    store: Arc<dyn AuditStore>,
    sink: Arc<Sink>,
    handler: Arc<Mutex<Handler>>,
    reader: Box<dyn ReplicationReader>,
    flush_timeout: Duration,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuditStore>,
        sink: Arc<Sink>,
        handler: Arc<Mutex<Handler>>,
        reader: Box<dyn ReplicationReader>,
    ) -> Self {
        Self {
            store,
            sink,
            handler,
            reader,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    /// Run until a termination signal or a reader failure.
    ///
    /// # Errors
    ///
    /// Startup failures (store preparation, recovery, offset load) and
    /// terminal reader errors; the caller turns these into a nonzero
    /// exit.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(termination_signal()).await
    }

    /// Like [`run`](Self::run) with an explicit shutdown future.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        let pipeline_cancel = {
            let handler = self.handler.lock().await;
            handler.cancel_token()
        };

        self.store
            .prepare()
            .await
            .context("prepare audit store indexes")?;
        self.sink
            .recover(&pipeline_cancel)
            .await
            .context("reconcile staging batches")?;

        let resume = match self
            .sink
            .load_offset(&pipeline_cancel)
            .await
            .context("load offset record")?
        {
            Some(offset) if !offset.token.is_empty() => {
                tracing::info!(position = %offset.position(), "resuming from stored offset");
                ResumeFrom::Stored(offset.token)
            }
            _ => {
                tracing::warn!(
                    "no stored offset for this source; starting from the source's current \
                     position, earlier events are not captured"
                );
                ResumeFrom::CurrentPosition
            }
        };

        let reader_cancel = CancellationToken::new();
        let mut reader = std::mem::replace(&mut self.reader, Box::new(NeverReader));
        let mut observer = SharedHandler(self.handler.clone());
        let task_cancel = reader_cancel.clone();
        let mut reader_task = tokio::spawn(async move {
            reader.run(&mut observer, resume, task_cancel).await
        });

        tokio::pin!(shutdown);
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("termination signal received, shutting down");
                reader_cancel.cancel();
                match tokio::time::timeout(READER_STOP_GRACE, &mut reader_task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(err))) => {
                        tracing::warn!(error = %err, "reader reported an error while stopping");
                    }
                    Ok(Err(join_err)) => {
                        tracing::warn!(error = %join_err, "reader task did not shut down cleanly");
                    }
                    Err(_) => {
                        tracing::warn!("reader ignored cancellation, aborting its task");
                        reader_task.abort();
                    }
                }

                self.final_flush(&pipeline_cancel).await;
                self.store.close().await;
                tracing::info!("shutdown complete");
                Ok(())
            }
            joined = &mut reader_task => {
                match joined {
                    Ok(Ok(())) => {
                        // The reader only returns cleanly when cancelled;
                        // without a signal this means the stream ended.
                        tracing::info!("reader finished, flushing and exiting");
                        self.final_flush(&pipeline_cancel).await;
                        self.store.close().await;
                        Ok(())
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "replication reader failed");
                        pipeline_cancel.cancel();
                        self.store.close().await;
                        Err(anyhow::Error::new(err).context("replication reader failed"))
                    }
                    Err(join_err) => {
                        pipeline_cancel.cancel();
                        self.store.close().await;
                        Err(anyhow::anyhow!("reader task panicked: {join_err}"))
                    }
                }
            }
        }
    }

    /// Flush the in-memory batch under the shutdown deadline. The
    /// flush runs under a fresh cancellation token so an
    /// already-cancelled pipeline token cannot stop it; on timeout the
    /// old token is cancelled to stop any straggling store calls.
    async fn final_flush(&self, pipeline_cancel: &CancellationToken) {
        let mut handler = self.handler.lock().await;
        if handler.buffered() == 0 {
            return;
        }
        handler.set_cancel_token(CancellationToken::new());
        match tokio::time::timeout(self.flush_timeout, handler.flush()).await {
            Ok(Ok(())) => tracing::info!("final flush complete"),
            Ok(Err(err)) => {
                tracing::warn!(
                    error = %err,
                    "final flush failed; the next start will recover from the source"
                );
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.flush_timeout.as_secs(),
                    "final flush exceeded its deadline; the next start will recover from the source"
                );
                pipeline_cancel.cancel();
            }
        }
    }
}

/// Placeholder left behind once the real reader moves into its task.
struct NeverReader;

#[async_trait::async_trait]
impl ReplicationReader for NeverReader {
    async fn run(
        &mut self,
        _observer: &mut (dyn rowtrail_reader::ChangeObserver + Send),
        _resume: ResumeFrom,
        cancel: CancellationToken,
    ) -> Result<(), rowtrail_reader::ReaderError> {
        cancel.cancelled().await;
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM; every other signal is left alone.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM, interrupt only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
