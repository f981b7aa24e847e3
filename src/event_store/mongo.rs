//! MongoDB Event Store Implementation
//!
//! This module implements the [`EventStore`] trait on top of a MongoDB
//! collection, one document per event. Under the transactional consistency
//! guarantee a second collection carries one version document per stream,
//! updated in the same multi-document transaction as event insertion.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tracing::{debug, info};

use crate::cloudevent::CloudEvent;
use crate::condition::WriteCondition;
use crate::config::{EventStoreConfig, StreamConsistencyGuarantee};
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event_store::document::{self, fields};
use crate::event_store::{EventStore, EventStream};

const VERSION: &str = "version";

/// MongoDB-backed event store
///
/// # Example
///
/// ```rust,no_run
/// use eventstore_mongodb::event_store::MongoEventStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MongoEventStore::connect("mongodb://localhost:27017", "events-db").await?;
///     // Use store...
///     Ok(())
/// }
/// ```
pub struct MongoEventStore {
    client: Client,
    db: Database,
    events: Collection<Document>,
    config: EventStoreConfig,
}

impl MongoEventStore {
    /// Connect to MongoDB and create an event store with the default
    /// configuration.
    ///
    /// The transactional guarantee requires the server to be a replica set
    /// (standalone deployments do not support transactions or change
    /// streams).
    pub async fn connect(uri: &str, database: &str) -> EventStoreResult<Self> {
        Self::connect_with_config(uri, database, EventStoreConfig::default()).await
    }

    /// Connect with a custom configuration.
    pub async fn connect_with_config(
        uri: &str,
        database: &str,
        config: EventStoreConfig,
    ) -> EventStoreResult<Self> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;

        info!(database, "connected to MongoDB");

        Self::new(client, database, config).await
    }

    /// Create an event store from an existing client.
    ///
    /// Creates the unique `(id, source)` index and, under the transactional
    /// guarantee, the `(streamId, streamOrder)` index.
    pub async fn new(
        client: Client,
        database: &str,
        config: EventStoreConfig,
    ) -> EventStoreResult<Self> {
        let db = client.database(database);
        let events = db.collection::<Document>(&config.event_collection);

        let store = Self {
            client,
            db,
            events,
            config,
        };
        store.ensure_indexes().await?;

        Ok(store)
    }

    /// The database this store operates on.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The configuration this store was created with.
    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    async fn ensure_indexes(&self) -> EventStoreResult<()> {
        let dedup = IndexModel::builder()
            .keys(doc! { fields::ID: 1, fields::SOURCE: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.events.create_index(dedup).await?;

        if matches!(
            self.config.consistency,
            StreamConsistencyGuarantee::Transactional { .. }
        ) {
            let order = IndexModel::builder()
                .keys(doc! { fields::STREAM_ID: 1, fields::STREAM_ORDER: 1 })
                .build();
            self.events.create_index(order).await?;
        }

        Ok(())
    }

    fn stream_versions(&self) -> Option<Collection<Document>> {
        match &self.config.consistency {
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => Some(self.db.collection::<Document>(stream_version_collection)),
            StreamConsistencyGuarantee::None => None,
        }
    }

    async fn write_transactional(
        &self,
        versions: &Collection<Document>,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> EventStoreResult<()> {
        let mut session = self.client.start_session().await?;

        // Standard transaction convention: rerun the whole transaction on
        // transient errors (e.g. write conflicts with a concurrent writer),
        // re-evaluating the write condition against the fresh version.
        loop {
            session.start_transaction().await?;

            match self
                .append_in_transaction(&mut session, versions, stream_id, condition, events)
                .await
            {
                Ok(()) => match commit_with_retry(&mut session).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR) => continue,
                    Err(e) => return Err(e.into()),
                },
                Err(e) => {
                    let _ = session.abort_transaction().await;

                    if let EventStoreError::Storage(storage) = &e {
                        if storage.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                            continue;
                        }
                    }

                    return Err(e);
                }
            }
        }
    }

    async fn append_in_transaction(
        &self,
        session: &mut ClientSession,
        versions: &Collection<Document>,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> EventStoreResult<()> {
        let version_document = versions
            .find_one(doc! { "_id": stream_id })
            .session(&mut *session)
            .await?;

        let current = match &version_document {
            Some(d) => d.get_i64(VERSION).map_err(|_| {
                EventStoreError::InvalidDocument(format!(
                    "stream {stream_id} has a malformed version document"
                ))
            })? as u64,
            None => 0,
        };

        if !condition.matches(current) {
            return Err(EventStoreError::WriteConditionNotFulfilled {
                condition: condition.clone(),
                actual: current,
            });
        }

        let documents = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                document::to_document(
                    event,
                    stream_id,
                    Some(current + 1 + i as u64),
                    self.config.time_representation,
                )
            })
            .collect::<EventStoreResult<Vec<_>>>()?;

        self.events
            .insert_many(documents)
            .session(&mut *session)
            .await
            .map_err(|e| {
                if is_duplicate_key_error(&e) {
                    EventStoreError::DuplicateCloudEvent(e)
                } else {
                    EventStoreError::Storage(e)
                }
            })?;

        let new_version = current + events.len() as u64;

        if version_document.is_some() {
            // The condition is also enforced server-side through the filter;
            // with the snapshot read above this can only miss on a write
            // conflict, which aborts the transaction anyway.
            let mut filter = doc! { "_id": stream_id };
            filter.extend(condition.to_filter(VERSION));

            let updated = versions
                .update_one(filter, doc! { "$set": { VERSION: new_version as i64 } })
                .session(&mut *session)
                .await?;

            if updated.matched_count == 0 {
                return Err(EventStoreError::WriteConditionNotFulfilled {
                    condition: condition.clone(),
                    actual: current,
                });
            }
        } else {
            versions
                .insert_one(doc! { "_id": stream_id, VERSION: new_version as i64 })
                .session(&mut *session)
                .await?;
        }

        debug!(stream_id, new_version, count = events.len(), "events appended");
        Ok(())
    }

    async fn write_unguarded(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: &[CloudEvent],
    ) -> EventStoreResult<()> {
        if condition != WriteCondition::AnyStreamVersion {
            return Err(EventStoreError::WriteConditionNotSupported(condition));
        }

        let documents = events
            .iter()
            .map(|event| {
                document::to_document(event, stream_id, None, self.config.time_representation)
            })
            .collect::<EventStoreResult<Vec<_>>>()?;

        // Ordered insert: on a duplicate key the bulk stops at the offending
        // document and everything before it stays persisted.
        self.events
            .insert_many(documents)
            .ordered(true)
            .await
            .map_err(|e| {
                if is_duplicate_key_error(&e) {
                    EventStoreError::DuplicateCloudEvent(e)
                } else {
                    EventStoreError::Storage(e)
                }
            })?;

        debug!(stream_id, count = events.len(), "events appended");
        Ok(())
    }

    async fn read_transactional(
        &self,
        versions: &Collection<Document>,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let result = self
            .read_in_transaction(&mut session, versions, stream_id, skip, limit)
            .await;

        match result {
            Ok(stream) => {
                commit_with_retry(&mut session).await?;
                Ok(stream)
            }
            Err(e) => {
                let _ = session.abort_transaction().await;
                Err(e)
            }
        }
    }

    async fn read_in_transaction(
        &self,
        session: &mut ClientSession,
        versions: &Collection<Document>,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        let version = versions
            .find_one(doc! { "_id": stream_id })
            .session(&mut *session)
            .await?
            .and_then(|d| d.get_i64(VERSION).ok())
            .unwrap_or(0) as u64;

        let mut find = self
            .events
            .find(doc! { fields::STREAM_ID: stream_id })
            .sort(doc! { fields::STREAM_ORDER: 1 })
            .skip(skip);
        if let Some(limit) = limit {
            find = find.limit(limit as i64);
        }

        let mut cursor = find.session(&mut *session).await?;

        let mut events = Vec::new();
        while let Some(document) = cursor.next(&mut *session).await.transpose()? {
            events.push(document::from_document(
                &document,
                self.config.time_representation,
            )?);
        }

        Ok(EventStream {
            stream_id: stream_id.to_string(),
            version,
            events,
        })
    }

    async fn read_unguarded(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        // Version is derived from the event count; a concurrent writer may
        // briefly make it disagree with the slice below.
        let version = self
            .events
            .count_documents(doc! { fields::STREAM_ID: stream_id })
            .await?;

        let mut find = self
            .events
            .find(doc! { fields::STREAM_ID: stream_id })
            .sort(doc! { "$natural": 1 })
            .skip(skip);
        if let Some(limit) = limit {
            find = find.limit(limit as i64);
        }

        let mut cursor = find.await?;

        let mut events = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            events.push(document::from_document(
                &document,
                self.config.time_representation,
            )?);
        }

        Ok(EventStream {
            stream_id: stream_id.to_string(),
            version,
            events,
        })
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> EventStoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        match self.stream_versions() {
            Some(versions) => {
                self.write_transactional(&versions, stream_id, &condition, &events)
                    .await
            }
            None => self.write_unguarded(stream_id, condition, &events).await,
        }
    }

    async fn read_range(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        match self.stream_versions() {
            Some(versions) => {
                self.read_transactional(&versions, stream_id, skip, limit)
                    .await
            }
            None => self.read_unguarded(stream_id, skip, limit).await,
        }
    }

    async fn exists(&self, stream_id: &str) -> EventStoreResult<bool> {
        let found = self
            .events
            .find_one(doc! { fields::STREAM_ID: stream_id })
            .await?;

        Ok(found.is_some())
    }

    async fn current_stream_version(&self, stream_id: &str) -> EventStoreResult<u64> {
        match self.stream_versions() {
            Some(versions) => {
                let version = versions
                    .find_one(doc! { "_id": stream_id })
                    .await?
                    .and_then(|d| d.get_i64(VERSION).ok())
                    .unwrap_or(0);
                Ok(version as u64)
            }
            None => {
                let count = self
                    .events
                    .count_documents(doc! { fields::STREAM_ID: stream_id })
                    .await?;
                Ok(count)
            }
        }
    }

    async fn delete_all_events_in_event_stream(&self, stream_id: &str) -> EventStoreResult<()> {
        // The version document is deliberately kept: the next write continues
        // from the preserved version.
        self.events
            .delete_many(doc! { fields::STREAM_ID: stream_id })
            .await?;

        debug!(stream_id, "deleted all events in stream");
        Ok(())
    }

    async fn delete_event_stream(&self, stream_id: &str) -> EventStoreResult<()> {
        match self.stream_versions() {
            Some(versions) => {
                let mut session = self.client.start_session().await?;
                session.start_transaction().await?;

                let result = async {
                    self.events
                        .delete_many(doc! { fields::STREAM_ID: stream_id })
                        .session(&mut session)
                        .await?;
                    versions
                        .delete_one(doc! { "_id": stream_id })
                        .session(&mut session)
                        .await?;
                    Ok::<_, mongodb::error::Error>(())
                }
                .await;

                match result {
                    Ok(()) => commit_with_retry(&mut session).await?,
                    Err(e) => {
                        let _ = session.abort_transaction().await;
                        return Err(e.into());
                    }
                }
            }
            None => {
                self.events
                    .delete_many(doc! { fields::STREAM_ID: stream_id })
                    .await?;
            }
        }

        debug!(stream_id, "deleted stream");
        Ok(())
    }

    async fn delete_event(&self, event_id: &str, source: &str) -> EventStoreResult<()> {
        self.events
            .delete_one(doc! { fields::ID: event_id, fields::SOURCE: source })
            .await?;

        Ok(())
    }
}

/// Commit, retrying while the outcome is unknown (per the driver's
/// transaction conventions).
async fn commit_with_retry(session: &mut ClientSession) -> mongodb::error::Result<()> {
    loop {
        match session.commit_transaction().await {
            Ok(()) => return Ok(()),
            Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Whether a MongoDB error is a unique-index violation (E11000).
pub(crate) fn is_duplicate_key_error(error: &mongodb::error::Error) -> bool {
    const DUPLICATE_KEY: i32 = 11000;

    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|w| w.code == DUPLICATE_KEY)),
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStore;

    // Integration tests with a real MongoDB replica set live in
    // tests/event_store_test.rs; these smoke tests are kept close to the
    // implementation and are ignored unless a server is available.

    #[tokio::test]
    #[ignore] // Requires MongoDB replica set
    async fn connect_and_write_read_round_trip() -> EventStoreResult<()> {
        let store = MongoEventStore::connect("mongodb://localhost:27017", "eventstore-smoke").await?;

        let stream_id = uuid::Uuid::now_v7().to_string();
        let event = CloudEvent::new("1", "urn:test", "com.example.name-defined");

        store.write(&stream_id, vec![event.clone()]).await?;

        let stream = store.read(&stream_id).await?;
        assert_eq!(stream.version, 1);
        assert_eq!(stream.events, vec![event]);

        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires MongoDB replica set
    async fn rejects_unfulfilled_write_condition() -> EventStoreResult<()> {
        let store = MongoEventStore::connect("mongodb://localhost:27017", "eventstore-smoke").await?;

        let stream_id = uuid::Uuid::now_v7().to_string();
        let event = CloudEvent::new("2", "urn:test", "com.example.name-defined");

        let result = store
            .write_conditionally(
                &stream_id,
                WriteCondition::stream_version_eq(10),
                vec![event],
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::WriteConditionNotFulfilled { actual: 0, .. })
        ));

        Ok(())
    }
}
