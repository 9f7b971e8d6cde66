//! Mapping from MongoDB driver errors to [`StoreError`] classes.
//!
//! Every code number and message fragment the pipeline keys on is
//! defined here and nowhere else.

use mongodb::error::{Error, ErrorKind, WriteFailure};

use crate::error::StoreError;

/// Unique-index collision on the event id.
pub(crate) const DUPLICATE_KEY: i32 = 11000;

/// WriteConcernFailed.
const WRITE_CONCERN_FAILED: i32 = 64;
/// NotWritablePrimary (election in progress).
const NOT_WRITABLE_PRIMARY: i32 = 10107;
/// NotPrimaryOrSecondary.
const NOT_PRIMARY_OR_SECONDARY: i32 = 13435;

/// Server messages that mean the deployment cannot run multi-document
/// transactions at all, as opposed to a transaction failing.
const NO_TRANSACTION_MARKERS: [&str; 2] = [
    "Transaction numbers are only allowed on a replica set",
    "Cannot insert into a time-series collection in a multi-document transaction",
];

pub(crate) fn is_transient_code(code: i32) -> bool {
    matches!(
        code,
        WRITE_CONCERN_FAILED | NOT_WRITABLE_PRIMARY | NOT_PRIMARY_OR_SECONDARY
    )
}

pub(crate) fn is_no_transaction_message(message: &str) -> bool {
    NO_TRANSACTION_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// True when a write failed only with duplicate-key collisions on the
/// event id. Such a failure means every colliding document was already
/// written by an earlier attempt of the same batch, so the commit can
/// proceed.
pub(crate) fn is_duplicate_only(err: &Error) -> bool {
    match &*err.kind {
        ErrorKind::BulkWrite(failure) => {
            failure.write_concern_error.is_none()
                && failure.write_errors.as_ref().is_some_and(|errors| {
                    !errors.is_empty() && errors.iter().all(|e| e.code == DUPLICATE_KEY)
                })
        }
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Collapse a driver error into the behavioral class the pipeline
/// reacts to.
pub(crate) fn map_error(err: Error) -> StoreError {
    let message = err.to_string();
    if is_no_transaction_message(&message) {
        return StoreError::TransactionsUnsupported(message);
    }
    if matches!(&*err.kind, ErrorKind::SessionsNotSupported) {
        return StoreError::TransactionsUnsupported(message);
    }

    let transient = match &*err.kind {
        ErrorKind::Command(command) => is_transient_code(command.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(_)) => true,
        ErrorKind::BulkWrite(failure) => {
            failure.write_concern_error.is_some() && failure.write_errors.is_none()
        }
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => true,
        ErrorKind::ConnectionPoolCleared { .. } => true,
        _ => false,
    } || err.contains_label("TransientTransactionError");

    if transient {
        StoreError::Transient(message)
    } else {
        StoreError::Rejected(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_code_set() {
        assert!(is_transient_code(64));
        assert!(is_transient_code(10107));
        assert!(is_transient_code(13435));
        assert!(!is_transient_code(11000));
        assert!(!is_transient_code(0));
        assert!(!is_transient_code(8000));
    }

    #[test]
    fn no_transaction_markers_match_server_messages() {
        assert!(is_no_transaction_message(
            "Transaction numbers are only allowed on a replica set member or mongos"
        ));
        assert!(is_no_transaction_message(
            "Cannot insert into a time-series collection in a multi-document transaction"
        ));
        assert!(!is_no_transaction_message("E11000 duplicate key error"));
        assert!(!is_no_transaction_message("connection refused"));
    }
}
