//! Event Store Abstraction
//!
//! This module defines the event storage interface for persisting and
//! retrieving CloudEvents in stream-scoped, append-only order.
//!
//! # Architecture
//!
//! ```text
//! Writer → WriteCondition → EventStore → Event Collection
//!                                │            │
//!                                │            └─ change stream → Subscriptions
//!                                └─ Stream Version Collection (transactional)
//! ```
//!
//! # Event Store Requirements
//!
//! 1. **Append-Only**: Events are never updated in place
//! 2. **Ordered**: Events maintain a dense, 1-based order within a stream
//! 3. **Conditional**: Writes can be guarded by version predicates
//! 4. **Deduplicated**: `(id, source)` is unique across the store
//! 5. **Replay**: Streams can be read back in order, with skip and limit
//!
//! # Example
//!
//! ```rust,no_run
//! use eventstore_mongodb::cloudevent::CloudEvent;
//! use eventstore_mongodb::condition::WriteCondition;
//! use eventstore_mongodb::event_store::{EventStore, MongoEventStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoEventStore::connect("mongodb://localhost:27017", "events-db").await?;
//!
//!     let event = CloudEvent::new("1", "urn:example", "com.example.name-defined");
//!     store
//!         .write_conditionally("name", WriteCondition::stream_version_eq(0), vec![event])
//!         .await?;
//!
//!     let stream = store.read("name").await?;
//!     assert_eq!(stream.version, 1);
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use crate::cloudevent::CloudEvent;
use crate::condition::WriteCondition;
use crate::errors::EventStoreResult;

pub mod document;
pub mod mongo;

pub use mongo::MongoEventStore;

/// Event store interface for stream-scoped CloudEvent persistence
///
/// Implementations must ensure:
///
/// - **Atomicity**: under the transactional guarantee a batch write succeeds
///   or fails as a unit
/// - **Monotonicity**: the stream version never decreases
/// - **Density**: under the transactional guarantee the stream orders of a
///   stream are exactly `1..=version`
/// - **Uniqueness**: at most one event per `(id, source)`
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream regardless of its current version.
    ///
    /// Equivalent to [`write_conditionally`](EventStore::write_conditionally)
    /// with [`WriteCondition::AnyStreamVersion`]. An empty batch is a no-op.
    async fn write(&self, stream_id: &str, events: Vec<CloudEvent>) -> EventStoreResult<()> {
        self.write_conditionally(stream_id, WriteCondition::AnyStreamVersion, events)
            .await
    }

    /// Append events to a stream, provided `condition` holds against its
    /// current version.
    ///
    /// # Errors
    ///
    /// - [`WriteConditionNotFulfilled`](crate::errors::EventStoreError::WriteConditionNotFulfilled)
    ///   if the condition does not hold; the store is unchanged
    /// - [`DuplicateCloudEvent`](crate::errors::EventStoreError::DuplicateCloudEvent)
    ///   if an event with the same `(id, source)` already exists, either in
    ///   the store or earlier in the same batch
    /// - [`WriteConditionNotSupported`](crate::errors::EventStoreError::WriteConditionNotSupported)
    ///   if a version condition is used while the consistency guarantee is
    ///   [`StreamConsistencyGuarantee::None`](crate::config::StreamConsistencyGuarantee::None)
    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> EventStoreResult<()>;

    /// Read a whole stream in stream order.
    ///
    /// A nonexistent stream yields `version = 0` and no events; it is never
    /// an error.
    async fn read(&self, stream_id: &str) -> EventStoreResult<EventStream> {
        self.read_range(stream_id, 0, None).await
    }

    /// Read a slice of a stream in stream order.
    ///
    /// `skip` and `limit` are applied server-side. Under the transactional
    /// guarantee the version and the events are read without skew; under
    /// `None` a concurrent writer may briefly make them disagree.
    async fn read_range(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream>;

    /// Whether at least one event exists for the stream.
    async fn exists(&self, stream_id: &str) -> EventStoreResult<bool>;

    /// The current version of the stream; `0` if it does not exist.
    async fn current_stream_version(&self, stream_id: &str) -> EventStoreResult<u64>;

    /// Remove every event in the stream while preserving its version.
    ///
    /// Under the transactional guarantee the stream metadata is kept, so the
    /// next write continues from the prior version (compaction that
    /// preserves history). Under `None` the version is derived and therefore
    /// becomes `0`.
    async fn delete_all_events_in_event_stream(&self, stream_id: &str) -> EventStoreResult<()>;

    /// Remove the stream entirely: its events and its metadata.
    async fn delete_event_stream(&self, stream_id: &str) -> EventStoreResult<()>;

    /// Remove a single event by `(id, source)`.
    ///
    /// The stream version is not altered; under the transactional guarantee
    /// this leaves a permanent gap in the stream order.
    async fn delete_event(&self, event_id: &str, source: &str) -> EventStoreResult<()>;
}

/// The result of reading an event stream
#[derive(Debug, Clone)]
pub struct EventStream {
    /// The stream that was read
    pub stream_id: String,

    /// Current version of the stream at read time
    pub version: u64,

    /// The requested slice of events, in stream order
    pub events: Vec<CloudEvent>,
}

impl EventStream {
    /// Whether the stream has no events (it may still have a preserved
    /// version after events-only deletion).
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
