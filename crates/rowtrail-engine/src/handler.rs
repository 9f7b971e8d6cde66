//! Row-event handler and batch assembly.
//!
//! Translates replication row events into audit events, buffers them
//! up to the batch threshold, and commits through the [`Sink`]. The
//! buffered batch always carries the source coordinate of its last
//! event, so a committed batch binds the offset to exactly the rows it
//! contains.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use rowtrail_reader::{ChangeObserver, ColumnMeta, RowChange, RowEvent, RowImage, TableRef};
use rowtrail_types::{AuditEvent, EventMeta, FieldDelta, LogPosition, OpKind, SourcePosition, SourceRef};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::schema::SchemaCache;
use crate::sink::{Sink, SinkError};

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Assembles audit events into batches and drives commits.
pub struct Handler {
    sink: Arc<Sink>,
    cancel: CancellationToken,
    timezone: Tz,
    batch_size: usize,
    schemas: SchemaCache,
    batch: Vec<AuditEvent>,
    /// Latest coordinate observed from the reader.
    current: SourcePosition,
    /// Coordinate of the last event appended to the batch.
    batch_position: SourcePosition,
    /// Tables already warned about for having no primary key.
    pkless_warned: HashSet<String>,
}

impl Handler {
    #[must_use]
    pub fn new(sink: Arc<Sink>, timezone: Tz, batch_size: usize, cancel: CancellationToken) -> Self {
        Self {
            sink,
            cancel,
            timezone,
            batch_size: batch_size.max(1),
            schemas: SchemaCache::new(),
            batch: Vec::new(),
            current: SourcePosition::default(),
            batch_position: SourcePosition::default(),
            pkless_warned: HashSet::new(),
        }
    }

    /// Number of events currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    /// Token used to cancel in-flight store calls.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Swap the cancellation token; the shutdown flush runs under a
    /// fresh one so it is bounded by its own deadline instead.
    pub fn set_cancel_token(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Commit whatever is buffered.
    ///
    /// # Errors
    ///
    /// Propagates the sink's failure; the buffer is kept so the events
    /// are not lost in memory.
    pub async fn flush(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        tracing::info!(events = self.batch.len(), "flushing buffered events");
        self.sink
            .commit(&self.batch, &self.batch_position, &self.cancel)
            .await?;
        self.batch.clear();
        Ok(())
    }

    async fn append(&mut self, event: AuditEvent) -> Result<(), SinkError> {
        self.batch.push(event);
        self.batch_position = self.current.clone();
        if self.batch.len() >= self.batch_size {
            self.sink
                .commit(&self.batch, &self.batch_position, &self.cancel)
                .await?;
            self.batch.clear();
        }
        Ok(())
    }

    fn build_event(
        &self,
        table: &TableRef,
        ts: chrono::DateTime<chrono::Utc>,
        op: OpKind,
        pk: Value,
        chg: BTreeMap<String, FieldDelta>,
    ) -> AuditEvent {
        let id = AuditEvent::compute_id(
            &table.schema,
            &table.name,
            &pk,
            ts,
            op,
            &self.current.file,
            self.current.pos,
            &self.current.token,
        );
        AuditEvent {
            id,
            ts,
            op,
            meta: EventMeta {
                db: table.schema.clone(),
                tbl: table.name.clone(),
                pk,
            },
            chg,
            src: SourceRef {
                binlog: LogPosition {
                    file: self.current.file.clone(),
                    pos: self.current.pos,
                },
                gtid: self.current.token.clone(),
            },
            ts_display: ts.with_timezone(&self.timezone).format(DISPLAY_FORMAT).to_string(),
        }
    }
}

/// Primary key of a row: the raw value for a single key column, the
/// pipe-joined string for a composite key. `None` when no key value is
/// present in the row image.
fn primary_key(columns: &[ColumnMeta], row: &RowImage) -> Option<Value> {
    let key_indexes: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.primary_key)
        .map(|(index, _)| index)
        .collect();

    match key_indexes.as_slice() {
        [] => None,
        [single] => row.get(*single).and_then(rowtrail_reader::FieldImage::as_value),
        many => {
            let parts: Vec<String> = many
                .iter()
                .filter_map(|index| row.get(*index))
                .filter_map(rowtrail_reader::FieldImage::as_value)
                .map(|value| rowtrail_types::event::pk_text(&value))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(Value::String(parts.join("|")))
            }
        }
    }
}

/// Column-wise change map for an insert: every carried value appears
/// as `to`.
fn insert_changes(columns: &[ColumnMeta], row: &RowImage) -> BTreeMap<String, FieldDelta> {
    let mut chg = BTreeMap::new();
    for (column, image) in columns.iter().zip(row) {
        if let Some(value) = image.as_value() {
            chg.insert(column.name.clone(), FieldDelta::appeared(value));
        }
    }
    chg
}

/// Column-wise change map for a delete: every carried value appears
/// as `from`.
fn delete_changes(columns: &[ColumnMeta], row: &RowImage) -> BTreeMap<String, FieldDelta> {
    let mut chg = BTreeMap::new();
    for (column, image) in columns.iter().zip(row) {
        if let Some(value) = image.as_value() {
            chg.insert(column.name.clone(), FieldDelta::removed(value));
        }
    }
    chg
}

/// Change map for an update: only columns present in both images and
/// actually different. Iteration stops at the shortest of the declared
/// columns and the two row images, which is what keeps translation
/// safe when the log carries fewer values than the table declares.
fn update_changes(
    columns: &[ColumnMeta],
    before: &RowImage,
    after: &RowImage,
) -> BTreeMap<String, FieldDelta> {
    let mut chg = BTreeMap::new();
    let bound = columns.len().min(before.len()).min(after.len());
    for index in 0..bound {
        let (Some(from), Some(to)) = (before[index].as_value(), after[index].as_value()) else {
            continue;
        };
        if from != to {
            chg.insert(columns[index].name.clone(), FieldDelta::changed(from, to));
        }
    }
    chg
}

#[async_trait]
impl ChangeObserver for Handler {
    async fn on_row(&mut self, event: RowEvent) -> anyhow::Result<()> {
        let qualified = event.table.to_string();

        let column_names: Vec<String> =
            event.columns.iter().map(|column| column.name.clone()).collect();
        if self.schemas.observe(&event.table.schema, &event.table.name, &column_names) {
            tracing::info!(table = %event.table, "column set changed since last event, flushing batch");
            self.flush().await?;
        }

        if !event.columns.iter().any(|column| column.primary_key) {
            if self.pkless_warned.insert(qualified) {
                tracing::warn!(
                    table = %event.table,
                    "table has no primary key, its rows are not captured"
                );
            }
            return Ok(());
        }

        match event.change {
            RowChange::Insert(rows) => {
                for row in rows {
                    let pk = primary_key(&event.columns, &row).unwrap_or(Value::Null);
                    let chg = insert_changes(&event.columns, &row);
                    let audit =
                        self.build_event(&event.table, event.ts, OpKind::Insert, pk, chg);
                    self.append(audit).await?;
                }
            }
            RowChange::Update(rows) => {
                for (before, after) in rows {
                    let pk = primary_key(&event.columns, &after).unwrap_or(Value::Null);
                    let chg = update_changes(&event.columns, &before, &after);
                    let audit =
                        self.build_event(&event.table, event.ts, OpKind::Update, pk, chg);
                    self.append(audit).await?;
                }
            }
            RowChange::Delete(rows) => {
                for row in rows {
                    let pk = primary_key(&event.columns, &row).unwrap_or(Value::Null);
                    let chg = delete_changes(&event.columns, &row);
                    let audit =
                        self.build_event(&event.table, event.ts, OpKind::Delete, pk, chg);
                    self.append(audit).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_position_token(&mut self, token: &str) -> anyhow::Result<()> {
        self.current.token = token.to_string();
        Ok(())
    }

    async fn on_position_synced(
        &mut self,
        file: &str,
        pos: u64,
        token: &str,
        _forced: bool,
    ) -> anyhow::Result<()> {
        self.current = SourcePosition::new(file, pos, token);
        Ok(())
    }

    async fn on_rotate(&mut self, next_file: &str, start_pos: u64) -> anyhow::Result<()> {
        self.current.file = next_file.to_string();
        self.current.pos = start_pos;
        Ok(())
    }

    async fn on_schema_changed(&mut self, table: &TableRef) -> anyhow::Result<()> {
        self.schemas.invalidate(&table.schema, &table.name);
        tracing::info!(table = %table, "schema change notification, flushing batch");
        // Replication keeps running; an unflushed batch is retried on
        // the next trigger and recovered from the source on a crash.
        if let Err(err) = self.flush().await {
            tracing::warn!(table = %table, error = %err, "flush on schema change failed");
        }
        Ok(())
    }
}

/// [`ChangeObserver`] adapter over a shared handler, for running the
/// reader on its own task while the supervisor keeps flush access.
pub struct SharedHandler(pub Arc<tokio::sync::Mutex<Handler>>);

#[async_trait]
impl ChangeObserver for SharedHandler {
    async fn on_row(&mut self, event: RowEvent) -> anyhow::Result<()> {
        self.0.lock().await.on_row(event).await
    }

    async fn on_position_token(&mut self, token: &str) -> anyhow::Result<()> {
        self.0.lock().await.on_position_token(token).await
    }

    async fn on_position_synced(
        &mut self,
        file: &str,
        pos: u64,
        token: &str,
        forced: bool,
    ) -> anyhow::Result<()> {
        self.0
            .lock()
            .await
            .on_position_synced(file, pos, token, forced)
            .await
    }

    async fn on_rotate(&mut self, next_file: &str, start_pos: u64) -> anyhow::Result<()> {
        self.0.lock().await.on_rotate(next_file, start_pos).await
    }

    async fn on_schema_changed(&mut self, table: &TableRef) -> anyhow::Result<()> {
        self.0.lock().await.on_schema_changed(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rowtrail_reader::FieldImage;
    use rowtrail_store::MemoryStore;

    const SOURCE: &str = "postgres://127.0.0.1:5432";

    fn columns(names: &[(&str, bool)]) -> Vec<ColumnMeta> {
        names
            .iter()
            .map(|(name, key)| ColumnMeta::new(*name, *key))
            .collect()
    }

    fn values(values: &[Value]) -> RowImage {
        values.iter().cloned().map(FieldImage::Value).collect()
    }

    fn handler(store: &Arc<MemoryStore>, batch_size: usize) -> Handler {
        let sink = Arc::new(Sink::new(store.clone() as Arc<dyn rowtrail_store::AuditStore>, SOURCE));
        Handler::new(sink, chrono_tz::UTC, batch_size, CancellationToken::new())
    }

    fn row_event(table: &str, cols: &[(&str, bool)], change: RowChange) -> RowEvent {
        RowEvent {
            table: TableRef::new("public", table),
            columns: columns(cols),
            ts: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            change,
        }
    }

    async fn sync(handler: &mut Handler, pos: u64, token: &str) {
        handler
            .on_position_synced("000000010000000000000000", pos, token, false)
            .await
            .unwrap();
    }

    #[test]
    fn single_column_primary_key_is_the_raw_value() {
        let cols = columns(&[("id", true), ("v", false)]);
        let row = values(&[Value::from(7), Value::from("x")]);
        assert_eq!(primary_key(&cols, &row), Some(Value::from(7)));
    }

    #[test]
    fn composite_primary_key_joins_with_pipes() {
        let cols = columns(&[("region", true), ("id", true), ("v", false)]);
        let row = values(&[Value::from("eu"), Value::from(9), Value::from("x")]);
        assert_eq!(primary_key(&cols, &row), Some(Value::from("eu|9")));
    }

    #[test]
    fn short_row_yields_no_key_instead_of_panicking() {
        let cols = columns(&[("a", false), ("id", true)]);
        let row = values(&[Value::from(1)]);
        assert_eq!(primary_key(&cols, &row), None);
    }

    #[test]
    fn update_changes_skip_equal_and_absent_columns() {
        let cols = columns(&[("id", true), ("v", false), ("blob", false)]);
        let before = vec![
            FieldImage::Value(Value::from(1)),
            FieldImage::Value(Value::from("a")),
            FieldImage::Unchanged,
        ];
        let after = vec![
            FieldImage::Value(Value::from(1)),
            FieldImage::Value(Value::from("b")),
            FieldImage::Unchanged,
        ];
        let chg = update_changes(&cols, &before, &after);
        assert_eq!(chg.len(), 1);
        assert_eq!(
            chg["v"],
            FieldDelta::changed(Value::from("a"), Value::from("b"))
        );
    }

    #[test]
    fn insert_changes_iterate_to_the_shorter_of_columns_and_row() {
        let cols = columns(&[("id", true), ("v", false), ("generated", false)]);
        let row = values(&[Value::from(1), Value::from("a")]);
        let chg = insert_changes(&cols, &row);
        assert_eq!(chg.len(), 2);
        assert!(chg.contains_key("id"));
        assert!(chg.contains_key("v"));
    }

    #[tokio::test]
    async fn rows_without_primary_key_are_skipped_once_logged() {
        let store = Arc::new(MemoryStore::new());
        let mut handler = handler(&store, 10);
        sync(&mut handler, 100, "0/100").await;
        for _ in 0..3 {
            handler
                .on_row(row_event(
                    "nokeys",
                    &[("a", false)],
                    RowChange::Insert(vec![values(&[Value::from(1)])]),
                ))
                .await
                .unwrap();
        }
        assert_eq!(handler.buffered(), 0);
        assert_eq!(handler.pkless_warned.len(), 1);
    }

    #[tokio::test]
    async fn batch_commits_at_threshold_with_the_latest_coordinate() {
        let store = Arc::new(MemoryStore::new());
        let mut handler = handler(&store, 3);
        for i in 0..3u64 {
            sync(&mut handler, 100 + i, &format!("0/{i}")).await;
            handler
                .on_row(row_event(
                    "users",
                    &[("id", true)],
                    RowChange::Insert(vec![values(&[Value::from(i)])]),
                ))
                .await
                .unwrap();
        }
        assert_eq!(handler.buffered(), 0);
        assert_eq!(store.event_count(), 3);
        let offset = store.offset(SOURCE).unwrap();
        assert_eq!(offset.token, "0/2");
        assert_eq!(offset.pos, 102);
    }

    #[tokio::test]
    async fn changed_column_set_flushes_before_translating_the_row() {
        let store = Arc::new(MemoryStore::new());
        let mut handler = handler(&store, 100);
        sync(&mut handler, 100, "0/100").await;
        handler
            .on_row(row_event(
                "users",
                &[("id", true)],
                RowChange::Insert(vec![values(&[Value::from(1)])]),
            ))
            .await
            .unwrap();
        assert_eq!(handler.buffered(), 1);

        sync(&mut handler, 101, "0/101").await;
        handler
            .on_row(row_event(
                "users",
                &[("id", true), ("v", false)],
                RowChange::Insert(vec![values(&[Value::from(2), Value::from("x")])]),
            ))
            .await
            .unwrap();

        // The first event was committed alone; the second is buffered.
        assert_eq!(handler.buffered(), 1);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn schema_change_with_empty_batch_only_clears_the_cache() {
        let store = Arc::new(MemoryStore::new());
        let mut handler = handler(&store, 100);
        handler
            .on_row(row_event(
                "users",
                &[("id", true)],
                RowChange::Insert(vec![values(&[Value::from(1)])]),
            ))
            .await
            .unwrap();
        handler.flush().await.unwrap();
        assert!(handler.schemas.get("public", "users").is_some());

        handler
            .on_schema_changed(&TableRef::new("public", "users"))
            .await
            .unwrap();
        assert!(handler.schemas.get("public", "users").is_none());
        assert_eq!(store.staging_batches().len(), 1);
    }

    #[tokio::test]
    async fn display_timestamp_uses_the_configured_timezone() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(Sink::new(
            store.clone() as Arc<dyn rowtrail_store::AuditStore>,
            SOURCE,
        ));
        let mut handler = Handler::new(
            sink,
            chrono_tz::Asia::Kolkata,
            100,
            CancellationToken::new(),
        );
        sync(&mut handler, 100, "0/100").await;
        handler
            .on_row(row_event(
                "users",
                &[("id", true)],
                RowChange::Insert(vec![values(&[Value::from(1)])]),
            ))
            .await
            .unwrap();
        handler.flush().await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        // 10:00 UTC is 15:30 in Kolkata.
        assert_eq!(events[0].ts_display, "2026-01-15 15:30:00");
    }

    #[tokio::test]
    async fn event_coordinates_come_from_the_current_position() {
        let store = Arc::new(MemoryStore::new());
        let mut handler = handler(&store, 100);
        handler.on_rotate("FILE2", 4).await.unwrap();
        handler.on_position_token("0/200").await.unwrap();
        handler
            .on_row(row_event(
                "users",
                &[("id", true)],
                RowChange::Insert(vec![values(&[Value::from(1)])]),
            ))
            .await
            .unwrap();
        handler.flush().await.unwrap();

        let events = store.events();
        assert_eq!(events[0].src.binlog.file, "FILE2");
        assert_eq!(events[0].src.binlog.pos, 4);
        assert_eq!(events[0].src.gtid, "0/200");
    }
}
