//! Staging batch documents: the durable recovery witness for an
//! in-flight commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AuditEvent;
use crate::time::opt_bson_datetime;

/// Lifecycle of a staging batch. `Pending` is the recovery window;
/// the only legal transitions are pending to committed and pending to
/// archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Committed,
    Archived,
}

impl BatchStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a batch being committed: the full event list plus
/// the position the batch carries. Written before the events, marked
/// committed after them, archived by recovery when the mark is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingBatch {
    #[serde(rename = "_id")]
    pub batch_id: String,
    pub events: Vec<AuditEvent>,
    pub source: String,
    pub token: String,
    pub file: String,
    pub pos: u64,
    #[serde(
        rename = "createdAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub created_at: DateTime<Utc>,
    pub status: BatchStatus,
    #[serde(
        rename = "committedAt",
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_bson_datetime"
    )]
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "archivedAt",
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_bson_datetime"
    )]
    pub archived_at: Option<DateTime<Utc>>,
}

/// Identity of a staging batch, without the event payload. Recovery
/// only needs to log and archive, never to replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingSummary {
    #[serde(rename = "_id")]
    pub batch_id: String,
    pub source: String,
    pub token: String,
    #[serde(
        rename = "createdAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub created_at: DateTime<Utc>,
}

impl StagingBatch {
    /// Identity projection of this batch.
    #[must_use]
    pub fn summary(&self) -> StagingSummary {
        StagingSummary {
            batch_id: self.batch_id.clone(),
            source: self.source.clone(),
            token: self.token.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> StagingBatch {
        StagingBatch {
            batch_id: "postgres://h:5432_1700000000000000000_0/16B37480".into(),
            events: Vec::new(),
            source: "postgres://h:5432".into(),
            token: "0/16B37480".into(),
            file: "000000010000000000000000".into(),
            pos: 380_000_384,
            created_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            status: BatchStatus::Pending,
            committed_at: None,
            archived_at: None,
        }
    }

    #[test]
    fn status_wire_strings() {
        assert_eq!(
            serde_json::to_string(&BatchStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&BatchStatus::Archived).unwrap(),
            "\"archived\""
        );
        assert_eq!(BatchStatus::Committed.as_str(), "committed");
    }

    #[test]
    fn pending_batch_omits_transition_timestamps() {
        let doc = bson::to_document(&sample()).unwrap();
        assert_eq!(doc.get_str("status").unwrap(), "pending");
        assert!(matches!(doc.get("createdAt"), Some(bson::Bson::DateTime(_))));
        assert!(doc.get("committedAt").is_none());
        assert!(doc.get("archivedAt").is_none());
    }

    #[test]
    fn committed_batch_roundtrips() {
        let mut batch = sample();
        batch.status = BatchStatus::Committed;
        batch.committed_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 1).unwrap());
        let doc = bson::to_document(&batch).unwrap();
        assert!(matches!(doc.get("committedAt"), Some(bson::Bson::DateTime(_))));
        let back: StagingBatch = bson::from_document(doc).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn summary_projects_identity_fields() {
        let batch = sample();
        let summary = batch.summary();
        assert_eq!(summary.batch_id, batch.batch_id);
        assert_eq!(summary.token, batch.token);
        assert_eq!(summary.created_at, batch.created_at);
    }
}
