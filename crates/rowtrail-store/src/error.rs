//! Store error classes.
//!
//! The pipeline only cares about behavior: transient failures are
//! retried, missing transaction support switches the commit to its
//! non-atomic fallback, and everything else is terminal for the
//! current attempt. The mapping from driver errors to these classes
//! lives in `classify`.

/// Errors produced by [`AuditStore`](crate::AuditStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Retryable: write-concern timeout, primary election in progress,
    /// or a network-level failure.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The deployment cannot run multi-document transactions.
    #[error("multi-document transactions unavailable: {0}")]
    TransactionsUnsupported(String),

    /// The store refused the operation for a non-transient reason.
    #[error("store rejected operation: {0}")]
    Rejected(String),

    /// A stored document could not be decoded.
    #[error("malformed store document: {0}")]
    Malformed(String),

    /// Internal lock was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the retry harness should try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the commit should fall back to non-atomic writes.
    #[must_use]
    pub fn is_transactions_unsupported(&self) -> bool {
        matches!(self, Self::TransactionsUnsupported(_))
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Rejected("bad".into()).is_transient());
        assert!(!StoreError::TransactionsUnsupported("standalone".into()).is_transient());
        assert!(!StoreError::LockPoisoned.is_transient());
    }

    #[test]
    fn fallback_trigger_is_its_own_class() {
        assert!(
            StoreError::TransactionsUnsupported("standalone".into())
                .is_transactions_unsupported()
        );
        assert!(!StoreError::Transient("x".into()).is_transactions_unsupported());
    }

    #[test]
    fn display_keeps_the_underlying_message() {
        let err = StoreError::Transient("connection reset".into());
        assert!(err.to_string().contains("connection reset"));
    }
}
