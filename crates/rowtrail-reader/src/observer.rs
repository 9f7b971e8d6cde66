//! The subscription contract between a replication reader and the
//! change handler.
//!
//! A reader delivers, per committed transaction: the position token,
//! then the row events, then a position-synced notification. Schema
//! changes and log-file rotations interleave as they occur. Callbacks
//! are delivered sequentially from a single task; an error return
//! halts the reader.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ReaderError;

/// A `(schema, table)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    #[must_use]
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Declared column as the source log describes it at event time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    /// Part of the table's replica key.
    pub primary_key: bool,
}

impl ColumnMeta {
    #[must_use]
    pub fn new(name: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            primary_key,
        }
    }
}

/// One column slot of a row image. `Unchanged` marks values the log
/// did not carry (e.g. large values untouched by an update); they are
/// treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldImage {
    Null,
    Unchanged,
    Value(Value),
}

impl FieldImage {
    /// The value carried at this slot, with SQL NULL represented as
    /// `Value::Null` and absent slots as `None`.
    #[must_use]
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Self::Null => Some(Value::Null),
            Self::Unchanged => None,
            Self::Value(v) => Some(v.clone()),
        }
    }
}

/// Column values in declared order. May be shorter than the declared
/// column list.
pub type RowImage = Vec<FieldImage>;

/// The rows of one change, shaped by operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert(Vec<RowImage>),
    /// Before/after pairs.
    Update(Vec<(RowImage, RowImage)>),
    Delete(Vec<RowImage>),
}

/// A committed row mutation as read from the replication log.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub table: TableRef,
    pub columns: Vec<ColumnMeta>,
    /// Commit time of the containing transaction, UTC.
    pub ts: DateTime<Utc>,
    pub change: RowChange,
}

/// Callback interface a reader delivers into.
#[async_trait]
pub trait ChangeObserver: Send {
    async fn on_row(&mut self, event: RowEvent) -> anyhow::Result<()>;

    /// A new position token was observed; emitted before the row
    /// events that belong to it.
    async fn on_position_token(&mut self, token: &str) -> anyhow::Result<()>;

    /// The reader has processed the log up to this coordinate.
    async fn on_position_synced(
        &mut self,
        file: &str,
        pos: u64,
        token: &str,
        forced: bool,
    ) -> anyhow::Result<()>;

    /// The log moved to a new physical file.
    async fn on_rotate(&mut self, next_file: &str, start_pos: u64) -> anyhow::Result<()>;

    /// The table's schema changed; delivered before further rows from
    /// that table.
    async fn on_schema_changed(&mut self, table: &TableRef) -> anyhow::Result<()>;
}

/// Where the reader should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Resume from a previously committed position token.
    Stored(String),
    /// No stored position: start from the source's current position.
    CurrentPosition,
}

/// A source of replication-log callbacks. `run` blocks until the
/// cancellation token fires (clean stop, `Ok`) or the source or the
/// observer fails.
#[async_trait]
pub trait ReplicationReader: Send + Sync {
    async fn run(
        &mut self,
        observer: &mut (dyn ChangeObserver + Send),
        resume: ResumeFrom,
        cancel: CancellationToken,
    ) -> Result<(), ReaderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_displays_qualified() {
        assert_eq!(TableRef::new("public", "users").to_string(), "public.users");
    }

    #[test]
    fn field_image_value_mapping() {
        assert_eq!(FieldImage::Null.as_value(), Some(Value::Null));
        assert_eq!(FieldImage::Unchanged.as_value(), None);
        assert_eq!(
            FieldImage::Value(Value::from(5)).as_value(),
            Some(Value::from(5))
        );
    }

    /// Both traits must stay object-safe; the engine holds them as
    /// trait objects.
    #[test]
    fn traits_are_object_safe() {
        fn _observer(_: &dyn ChangeObserver) {}
        fn _reader(_: &dyn ReplicationReader) {}
    }
}
