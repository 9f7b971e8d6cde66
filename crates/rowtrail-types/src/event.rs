//! Audit event document model.
//!
//! Field names follow the stable wire shape of the audit store; the
//! event id is a deterministic hash of the source coordinates so that
//! replaying the same row change always produces the same document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Row operation kind, stored as `"i"`, `"u"`, or `"d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl OpKind {
    /// Wire-format string for storage and id hashing.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after pair for a single column. A missing side means the
/// column had no value there (inserts have no `f`, deletes no `t`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldDelta {
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,
}

impl FieldDelta {
    #[must_use]
    pub fn appeared(to: Value) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    #[must_use]
    pub fn removed(from: Value) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    #[must_use]
    pub fn changed(from: Value, to: Value) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }
}

/// Identity of the mutated row: database, table, and primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub db: String,
    pub tbl: String,
    pub pk: Value,
}

/// Physical location of an event in the source log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub file: String,
    pub pos: u64,
}

/// Source coordinates carried on every event: the physical log
/// location plus the opaque position token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub binlog: LogPosition,
    pub gtid: String,
}

/// One committed row mutation, ready for the audit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Deterministic id, see [`AuditEvent::compute_id`]. Doubles as the
    /// document primary key so replays collide instead of duplicating.
    #[serde(rename = "_id")]
    pub id: String,
    /// Commit time of the mutation on the source, UTC.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub ts: DateTime<Utc>,
    pub op: OpKind,
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chg: BTreeMap<String, FieldDelta>,
    pub src: SourceRef,
    /// `YYYY-MM-DD HH:MM:SS` rendering of `ts` in the configured
    /// display timezone.
    pub ts_display: String,
}

impl AuditEvent {
    /// Hash the identifying tuple of a row mutation into the event id.
    ///
    /// Pure function of its inputs: the same row change replayed after
    /// a restart hashes to the same id, which is what lets the store
    /// absorb replays as duplicate-key writes.
    #[must_use]
    pub fn compute_id(
        db: &str,
        tbl: &str,
        pk: &Value,
        ts: DateTime<Utc>,
        op: OpKind,
        file: &str,
        pos: u64,
        token: &str,
    ) -> String {
        let raw = format!(
            "{db}|{tbl}|{pk}|{micros}|{op}|{file}|{pos}|{token}",
            pk = pk_text(pk),
            micros = ts.timestamp_micros(),
            op = op.as_str(),
        );
        hex::encode(Sha256::digest(raw.as_bytes()))
    }
}

/// Canonical scalar rendering of a primary-key value for hashing.
/// Strings render unquoted so the id does not depend on how the value
/// was serialized upstream.
#[must_use]
pub fn pk_text(pk: &Value) -> String {
    match pk {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
