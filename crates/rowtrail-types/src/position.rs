//! Replication-log coordinates and the per-source offset record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in the source's replication log: physical file and byte
/// offset plus the opaque position token the source resumes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcePosition {
    pub file: String,
    pub pos: u64,
    pub token: String,
}

impl SourcePosition {
    #[must_use]
    pub fn new(file: impl Into<String>, pos: u64, token: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            pos,
            token: token.into(),
        }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.pos, self.token)
    }
}

/// Last durably committed position for one source. Exactly one record
/// exists per source id; it only moves inside a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    #[serde(rename = "_id")]
    pub source: String,
    pub token: String,
    pub file: String,
    pub pos: u64,
    #[serde(
        rename = "updatedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub updated_at: DateTime<Utc>,
}

impl OffsetRecord {
    #[must_use]
    pub fn new(source: impl Into<String>, position: &SourcePosition, updated_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            token: position.token.clone(),
            file: position.file.clone(),
            pos: position.pos,
            updated_at,
        }
    }

    /// The stored coordinate as a [`SourcePosition`].
    #[must_use]
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            file: self.file.clone(),
            pos: self.pos,
            token: self.token.clone(),
        }
    }
}
