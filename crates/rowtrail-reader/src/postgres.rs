//! PostgreSQL logical-decoding reader.
//!
//! Polls a logical replication slot with
//! `pg_logical_slot_peek_binary_changes` (non-destructive) and decodes
//! the pgoutput stream into observer callbacks. The slot is advanced
//! only to positions the pipeline reports as durably committed, so a
//! crash replays exactly the uncommitted suffix of the log.
//!
//! Requirements on the source: `wal_level=logical`, an existing
//! publication covering the audited tables, and REPLICA IDENTITY FULL
//! where full before-images are wanted (updates and deletes otherwise
//! fall back to the key columns).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::error::ReaderError;
use crate::filter::TableFilter;
use crate::lsn::Lsn;
use crate::observer::{
    ChangeObserver, ColumnMeta, ReplicationReader, ResumeFrom, RowChange, RowEvent, RowImage,
    TableRef,
};
use crate::wal::{self, RawTuple, Relation, WalMessage};

const PEEK_CHANGES: &str = "SELECT lsn::text, data \
     FROM pg_logical_slot_peek_binary_changes(\
         $1, NULL, $2, \
         'proto_version', '1', \
         'publication_names', $3\
     )";

const CREATE_SLOT: &str = "SELECT pg_create_logical_replication_slot($1, 'pgoutput')";
const ADVANCE_SLOT: &str = "SELECT pg_replication_slot_advance($1, $2::pg_lsn)";
const SLOT_CONFIRMED: &str =
    "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1";
const PUBLICATION_EXISTS: &str = "SELECT 1 FROM pg_publication WHERE pubname = $1";
const CURRENT_WAL_LSN: &str = "SELECT pg_current_wal_lsn()::text";
const TIMELINE_ID: &str = "SELECT timeline_id FROM pg_control_checkpoint()";

/// SQLSTATE for duplicate_object, raised when the slot already exists.
const DUPLICATE_OBJECT: &str = "42710";

/// Connection parameters and tuning for the polling reader.
#[derive(Debug, Clone)]
pub struct PostgresReaderConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub application_name: String,
    pub slot: String,
    pub publication: String,
    pub poll_interval: Duration,
    /// Upper bound on changes fetched per poll; int4 because the slot
    /// functions take one.
    pub max_changes: i32,
    pub reconnect_delay: Duration,
    pub max_connect_failures: u32,
}

impl PostgresReaderConfig {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            application_name: "rowtrail".into(),
            slot: "rowtrail".into(),
            publication: "rowtrail".into(),
            poll_interval: Duration::from_millis(500),
            max_changes: 10_000,
            reconnect_delay: Duration::from_secs(2),
            max_connect_failures: 10,
        }
    }
}

struct TxState {
    token: Lsn,
    ts: DateTime<Utc>,
}

enum SessionFailure {
    /// Lost or unreachable connection; retried within the budget.
    Connection(String),
    /// Not worth reconnecting for.
    Fatal(ReaderError),
}

/// Replication reader over a PostgreSQL logical slot.
pub struct PostgresReader {
    config: PostgresReaderConfig,
    filter: TableFilter,
    commit_feed: Option<watch::Receiver<Option<String>>>,
    relations: HashMap<u32, Relation>,
    timeline: u32,
    current_file: Option<String>,
    /// Commit location of the last fully delivered transaction.
    last_commit: Option<Lsn>,
    /// How far the slot itself has been advanced.
    advanced_to: Option<Lsn>,
    tx: Option<TxState>,
    skipping: bool,
    started: bool,
    progressed: bool,
}

impl PostgresReader {
    #[must_use]
    pub fn new(config: PostgresReaderConfig, filter: TableFilter) -> Self {
        Self {
            config,
            filter,
            commit_feed: None,
            relations: HashMap::new(),
            timeline: 1,
            current_file: None,
            last_commit: None,
            advanced_to: None,
            tx: None,
            skipping: false,
            started: false,
            progressed: false,
        }
    }

    /// Attach the pipeline's committed-position feed. The slot only
    /// advances past positions observed here.
    #[must_use]
    pub fn with_commit_feed(mut self, feed: watch::Receiver<Option<String>>) -> Self {
        self.commit_feed = Some(feed);
        self
    }

    async fn connect(&self) -> Result<Client, SessionFailure> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .user(&self.config.user)
            .password(&self.config.password)
            .dbname(&self.config.database)
            .application_name(&self.config.application_name);

        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(connection_err)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "source connection closed");
            }
        });
        Ok(client)
    }

    async fn ensure_slot(&self, client: &Client) -> Result<(), SessionFailure> {
        match client.query_one(CREATE_SLOT, &[&self.config.slot]).await {
            Ok(_) => {
                tracing::info!(slot = self.config.slot, "created logical replication slot");
                Ok(())
            }
            Err(err) => {
                let already_exists = err
                    .as_db_error()
                    .is_some_and(|db| db.code().code() == DUPLICATE_OBJECT);
                if already_exists {
                    tracing::debug!(slot = self.config.slot, "replication slot already exists");
                    Ok(())
                } else if err.as_db_error().is_some() {
                    Err(SessionFailure::Fatal(ReaderError::Config(format!(
                        "cannot create replication slot {:?} (is wal_level=logical?): {err}",
                        self.config.slot
                    ))))
                } else {
                    Err(connection_err(err))
                }
            }
        }
    }

    async fn check_publication(&self, client: &Client) -> Result<(), SessionFailure> {
        let rows = client
            .query(PUBLICATION_EXISTS, &[&self.config.publication])
            .await
            .map_err(connection_err)?;
        if rows.is_empty() {
            return Err(SessionFailure::Fatal(ReaderError::Config(format!(
                "publication {:?} does not exist on the source",
                self.config.publication
            ))));
        }
        Ok(())
    }

    async fn fetch_timeline(client: &Client) -> u32 {
        match client.query_one(TIMELINE_ID, &[]).await {
            Ok(row) => row
                .try_get::<_, i32>(0)
                .ok()
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(1),
            Err(err) => {
                tracing::debug!(error = %err, "cannot read timeline id, assuming 1");
                1
            }
        }
    }

    async fn slot_confirmed(&self, client: &Client) -> Result<Option<Lsn>, SessionFailure> {
        let row = client
            .query_opt(SLOT_CONFIRMED, &[&self.config.slot])
            .await
            .map_err(connection_err)?;
        Ok(row
            .and_then(|r| r.get::<_, Option<String>>(0))
            .and_then(|text| Lsn::parse(&text)))
    }

    async fn advance_slot(&self, client: &Client, to: Lsn) -> Result<(), SessionFailure> {
        client
            .query(ADVANCE_SLOT, &[&self.config.slot, &to.to_string()])
            .await
            .map_err(connection_err)?;
        Ok(())
    }

    async fn resolve_start(
        &mut self,
        client: &Client,
        resume: &ResumeFrom,
    ) -> Result<(), SessionFailure> {
        match resume {
            ResumeFrom::Stored(token) => {
                let requested = Lsn::parse(token).ok_or_else(|| {
                    SessionFailure::Fatal(ReaderError::InvalidPosition {
                        token: token.clone(),
                        reason: "expected X/YYYYYYYY".into(),
                    })
                })?;
                if let Some(confirmed) = self.slot_confirmed(client).await? {
                    if requested < confirmed {
                        // The slot has already discarded that history.
                        tracing::warn!(
                            requested = %requested,
                            effective = %confirmed,
                            "stored position is no longer available from the source; \
                             events in between are not captured"
                        );
                        self.last_commit = Some(confirmed);
                        self.advanced_to = Some(confirmed);
                        return Ok(());
                    }
                }
                self.advance_slot(client, requested).await?;
                self.last_commit = Some(requested);
                self.advanced_to = Some(requested);
                tracing::info!(position = %requested, "resuming from stored position");
            }
            ResumeFrom::CurrentPosition => {
                let row = client
                    .query_one(CURRENT_WAL_LSN, &[])
                    .await
                    .map_err(connection_err)?;
                let text: String = row.get(0);
                let current = Lsn::parse(&text).ok_or_else(|| {
                    SessionFailure::Fatal(ReaderError::Config(format!(
                        "source reported unparseable position {text:?}"
                    )))
                })?;
                self.advance_slot(client, current).await?;
                self.last_commit = Some(current);
                self.advanced_to = Some(current);
                tracing::info!(position = %current, "starting from the source's current position");
            }
        }
        Ok(())
    }

    async fn advance_slot_to_committed(&mut self, client: &Client) -> Result<(), SessionFailure> {
        let Some(feed) = &self.commit_feed else {
            return Ok(());
        };
        let committed = feed.borrow().clone();
        let Some(lsn) = committed.as_deref().and_then(Lsn::parse) else {
            return Ok(());
        };
        if self.advanced_to.is_some_and(|at| lsn <= at) {
            return Ok(());
        }
        self.advance_slot(client, lsn).await?;
        self.advanced_to = Some(lsn);
        tracing::debug!(position = %lsn, "slot advanced to committed position");
        Ok(())
    }

    async fn session(
        &mut self,
        observer: &mut (dyn ChangeObserver + Send),
        resume: &ResumeFrom,
        cancel: &CancellationToken,
    ) -> Result<(), SessionFailure> {
        let client = self.connect().await?;

        if !self.started {
            self.timeline = Self::fetch_timeline(&client).await;
            self.ensure_slot(&client).await?;
            self.check_publication(&client).await?;
            self.resolve_start(&client, resume).await?;
            self.started = true;
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.advance_slot_to_committed(&client).await?;

            let rows = client
                .query(
                    PEEK_CHANGES,
                    &[
                        &self.config.slot,
                        &self.config.max_changes,
                        &self.config.publication,
                    ],
                )
                .await
                .map_err(connection_err)?;
            self.progressed = true;

            let mut delivered = 0usize;
            for row in &rows {
                let lsn_text: String = row.get(0);
                let data: &[u8] = row.get(1);
                delivered += self.dispatch(observer, &lsn_text, data).await?;
            }

            if delivered == 0 {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Turn one decoded message into observer callbacks. Returns how
    /// many callbacks were delivered.
    async fn dispatch(
        &mut self,
        observer: &mut (dyn ChangeObserver + Send),
        lsn_text: &str,
        data: &[u8],
    ) -> Result<usize, SessionFailure> {
        let message = match wal::decode(data) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(lsn = lsn_text, error = %err, "undecodable replication message skipped");
                return Ok(0);
            }
        };

        match message {
            WalMessage::Begin {
                final_lsn,
                commit_ts_micros,
                ..
            } => {
                if self.last_commit.is_some_and(|seen| final_lsn <= seen) {
                    // Already delivered; the slot just has not advanced
                    // past it yet.
                    self.skipping = true;
                    return Ok(0);
                }
                self.skipping = false;
                self.tx = Some(TxState {
                    token: final_lsn,
                    ts: pg_timestamp(commit_ts_micros),
                });
                observer
                    .on_position_token(&final_lsn.to_string())
                    .await
                    .map_err(handler_err)?;
                Ok(1)
            }
            WalMessage::Relation(relation) => {
                let changed = self
                    .relations
                    .get(&relation.oid)
                    .is_some_and(|previous| *previous != relation);
                let table = TableRef::new(relation.schema.clone(), relation.name.clone());
                self.relations.insert(relation.oid, relation);
                if changed {
                    tracing::info!(table = %table, "table schema changed");
                    observer.on_schema_changed(&table).await.map_err(handler_err)?;
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            WalMessage::Insert { relation, new } if !self.skipping => {
                self.deliver(observer, relation, |rel| {
                    RowChange::Insert(vec![tuple_image(rel, &new)])
                })
                .await
            }
            WalMessage::Update {
                relation,
                old,
                key,
                new,
            } if !self.skipping => {
                self.deliver(observer, relation, |rel| {
                    let before = old
                        .or(key)
                        .map(|tuple| tuple_image(rel, &tuple))
                        .unwrap_or_default();
                    RowChange::Update(vec![(before, tuple_image(rel, &new))])
                })
                .await
            }
            WalMessage::Delete { relation, old, key } if !self.skipping => {
                self.deliver(observer, relation, |rel| {
                    let image = old
                        .or(key)
                        .map(|tuple| tuple_image(rel, &tuple))
                        .unwrap_or_default();
                    RowChange::Delete(vec![image])
                })
                .await
            }
            WalMessage::Commit { end_lsn, .. } if !self.skipping => {
                let Some(tx) = self.tx.take() else {
                    return Ok(0);
                };
                let file = end_lsn.wal_file(self.timeline);
                let mut delivered = 1;
                if self.current_file.as_deref() != Some(file.as_str()) {
                    observer
                        .on_rotate(&file, end_lsn.segment_offset())
                        .await
                        .map_err(handler_err)?;
                    self.current_file = Some(file.clone());
                    delivered += 1;
                }
                observer
                    .on_position_synced(
                        &file,
                        end_lsn.segment_offset(),
                        &tx.token.to_string(),
                        false,
                    )
                    .await
                    .map_err(handler_err)?;
                self.last_commit = Some(tx.token);
                Ok(delivered)
            }
            _ => Ok(0),
        }
    }

    async fn deliver(
        &mut self,
        observer: &mut (dyn ChangeObserver + Send),
        relation_oid: u32,
        change: impl FnOnce(&Relation) -> RowChange + Send,
    ) -> Result<usize, SessionFailure> {
        let Some(tx) = &self.tx else {
            return Ok(0);
        };
        let Some(relation) = self.relations.get(&relation_oid) else {
            tracing::warn!(relation = relation_oid, "row for unknown relation skipped");
            return Ok(0);
        };
        let table = TableRef::new(relation.schema.clone(), relation.name.clone());
        if !self.filter.allows(&table) {
            return Ok(0);
        }
        let event = RowEvent {
            table,
            columns: relation
                .columns
                .iter()
                .map(|column| ColumnMeta::new(column.name.clone(), column.key))
                .collect(),
            ts: tx.ts,
            change: change(relation),
        };
        observer.on_row(event).await.map_err(handler_err)?;
        Ok(1)
    }
}

#[async_trait::async_trait]
impl ReplicationReader for PostgresReader {
    async fn run(
        &mut self,
        observer: &mut (dyn ChangeObserver + Send),
        resume: ResumeFrom,
        cancel: CancellationToken,
    ) -> Result<(), ReaderError> {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.session(observer, &resume, &cancel).await {
                Ok(()) => return Ok(()),
                Err(SessionFailure::Fatal(err)) => return Err(err),
                Err(SessionFailure::Connection(message)) => {
                    if std::mem::take(&mut self.progressed) {
                        failures = 1;
                    } else {
                        failures += 1;
                    }
                    if failures > self.config.max_connect_failures {
                        return Err(ReaderError::Unavailable(message));
                    }
                    tracing::warn!(
                        attempt = failures,
                        max_attempts = self.config.max_connect_failures,
                        error = %message,
                        "source connection lost, reconnecting"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

fn tuple_image(relation: &Relation, tuple: &RawTuple) -> RowImage {
    relation
        .columns
        .iter()
        .zip(&tuple.0)
        .map(|(column, raw)| wal::field_image(column, raw))
        .collect()
}

fn connection_err(err: tokio_postgres::Error) -> SessionFailure {
    SessionFailure::Connection(err.to_string())
}

fn handler_err(err: anyhow::Error) -> SessionFailure {
    SessionFailure::Fatal(ReaderError::Handler(err))
}

/// Convert a pgoutput timestamp (microseconds since 2000-01-01 UTC)
/// into a chrono instant.
fn pg_timestamp(micros_since_pg_epoch: i64) -> DateTime<Utc> {
    const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
    DateTime::from_timestamp_micros(PG_EPOCH_UNIX_MICROS + micros_since_pg_epoch)
        .unwrap_or(DateTime::UNIX_EPOCH)
}
