//! MongoDB-backed implementation of [`AuditStore`].
//!
//! Collection layout: `events` keyed by the deterministic event id,
//! `offsets` keyed by the source id, and `<events>_staging` keyed by
//! the batch id with a status index and a 7-day TTL on `createdAt`.

use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use mongodb::options::{
    ClientOptions, FindOptions, IndexOptions, InsertManyOptions, UpdateOptions,
};
use mongodb::{Client, ClientSession, Collection, IndexModel};
use rowtrail_types::{AuditEvent, BatchStatus, OffsetRecord, StagingBatch, StagingSummary};

use crate::classify;
use crate::error::Result;
use crate::store::AuditStore;

/// Staging documents expire a week after creation.
const STAGING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_APP_NAME: &str = "rowtrail";

/// MongoDB audit store. The events and offsets primary keys are the
/// `_id` field, so id uniqueness needs no extra index.
pub struct MongoStore {
    client: Client,
    events: Collection<AuditEvent>,
    offsets: Collection<OffsetRecord>,
    staging: Collection<StagingBatch>,
}

impl MongoStore {
    /// Connect to the audit store. The staging collection name is
    /// derived from the events collection name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) when the URI does not
    /// parse or the client cannot be constructed.
    pub async fn connect(
        uri: &str,
        database: &str,
        events_collection: &str,
        offsets_collection: &str,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(classify::map_error)?;
        if options.app_name.is_none() {
            options.app_name = Some(DEFAULT_APP_NAME.to_string());
        }
        let client = Client::with_options(options).map_err(classify::map_error)?;
        let db = client.database(database);
        Ok(Self {
            events: db.collection(events_collection),
            offsets: db.collection(offsets_collection),
            staging: db.collection(&format!("{events_collection}_staging")),
            client,
        })
    }

    /// Bulk-insert events, absorbing collisions on already-written ids.
    async fn insert_events(
        &self,
        session: Option<&mut ClientSession>,
        events: &[AuditEvent],
    ) -> Result<()> {
        let options = InsertManyOptions::builder().ordered(false).build();
        let outcome = match session {
            Some(session) => {
                self.events
                    .insert_many_with_session(events, options, session)
                    .await
            }
            None => self.events.insert_many(events, options).await,
        };
        match outcome {
            Ok(_) => Ok(()),
            Err(err) if classify::is_duplicate_only(&err) => {
                tracing::debug!(
                    events = events.len(),
                    "duplicate event ids absorbed; batch was already written"
                );
                Ok(())
            }
            Err(err) => Err(classify::map_error(err)),
        }
    }

    async fn upsert_offset(
        &self,
        session: Option<&mut ClientSession>,
        offset: &OffsetRecord,
    ) -> Result<()> {
        let query = doc! { "_id": &offset.source };
        let update = doc! { "$set": {
            "token": &offset.token,
            "file": &offset.file,
            "pos": i64::try_from(offset.pos).unwrap_or(i64::MAX),
            "updatedAt": bson::DateTime::from_chrono(offset.updated_at),
        }};
        let options = UpdateOptions::builder().upsert(true).build();
        let outcome = match session {
            Some(session) => {
                self.offsets
                    .update_one_with_session(query, update, options, session)
                    .await
            }
            None => self.offsets.update_one(query, update, options).await,
        };
        outcome.map(|_| ()).map_err(classify::map_error)
    }
}

#[async_trait]
impl AuditStore for MongoStore {
    async fn prepare(&self) -> Result<()> {
        let status_index = IndexModel::builder()
            .keys(doc! { "status": 1 })
            .build();
        let ttl_index = IndexModel::builder()
            .keys(doc! { "createdAt": 1 })
            .options(IndexOptions::builder().expire_after(STAGING_TTL).build())
            .build();
        self.staging
            .create_indexes([status_index, ttl_index], None)
            .await
            .map(|_| ())
            .map_err(classify::map_error)
    }

    async fn load_offset(&self, source: &str) -> Result<Option<OffsetRecord>> {
        self.offsets
            .find_one(doc! { "_id": source }, None)
            .await
            .map_err(classify::map_error)
    }

    async fn stage_batch(&self, batch: &StagingBatch) -> Result<()> {
        self.staging
            .insert_one(batch, None)
            .await
            .map(|_| ())
            .map_err(classify::map_error)
    }

    async fn commit_atomic(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(classify::map_error)?;
        session
            .start_transaction(None)
            .await
            .map_err(classify::map_error)?;

        let applied = async {
            self.insert_events(Some(&mut session), events).await?;
            self.upsert_offset(Some(&mut session), offset).await
        }
        .await;

        match applied {
            Ok(()) => session
                .commit_transaction()
                .await
                .map_err(classify::map_error),
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    async fn commit_unordered(&self, events: &[AuditEvent], offset: &OffsetRecord) -> Result<()> {
        self.insert_events(None, events).await?;
        self.upsert_offset(None, offset).await
    }

    async fn mark_committed(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.staging
            .update_one(
                doc! { "_id": batch_id },
                doc! { "$set": {
                    "status": BatchStatus::Committed.as_str(),
                    "committedAt": bson::DateTime::from_chrono(at),
                }},
                None,
            )
            .await
            .map(|_| ())
            .map_err(classify::map_error)
    }

    async fn pending_batches(&self, source: &str) -> Result<Vec<StagingSummary>> {
        let filter = doc! { "status": BatchStatus::Pending.as_str(), "source": source };
        let options = FindOptions::builder()
            .projection(doc! { "events": 0 })
            .sort(doc! { "createdAt": 1 })
            .build();
        let mut cursor = self
            .staging
            .clone_with_type::<StagingSummary>()
            .find(filter, options)
            .await
            .map_err(classify::map_error)?;

        let mut pending = Vec::new();
        while cursor.advance().await.map_err(classify::map_error)? {
            pending.push(cursor.deserialize_current().map_err(classify::map_error)?);
        }
        Ok(pending)
    }

    async fn archive_batch(&self, batch_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.staging
            .update_one(
                doc! { "_id": batch_id },
                doc! { "$set": {
                    "status": BatchStatus::Archived.as_str(),
                    "archivedAt": bson::DateTime::from_chrono(at),
                }},
                None,
            )
            .await
            .map(|_| ())
            .map_err(classify::map_error)
    }

    async fn close(&self) {
        // The driver tears the connection pool down on drop; nothing to
        // flush here.
        tracing::debug!("audit store client released");
    }
}
