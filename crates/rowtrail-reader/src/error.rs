//! Reader error classes.

/// Errors surfaced by a [`ReplicationReader`](crate::ReplicationReader).
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The source could not be reached within the reconnection budget.
    #[error("replication source unavailable: {0}")]
    Unavailable(String),

    /// The stored resume token does not parse as a source position.
    #[error("invalid resume position {token:?}: {reason}")]
    InvalidPosition { token: String, reason: String },

    /// The source rejected the reader's configuration (missing
    /// publication, bad slot, insufficient privileges).
    #[error("source configuration rejected: {0}")]
    Config(String),

    /// The change handler failed; replication halts so the source can
    /// replay from the last committed position on the next start.
    #[error("change handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}
