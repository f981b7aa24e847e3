//! MongoDB-backed event store and change-stream subscriptions for CloudEvents
//!
//! This library persists ordered streams of CloudEvents in MongoDB and
//! exposes a durable, filterable, resumable subscription model on top of the
//! same database's change stream:
//!
//! - **Event store**: write-optimistic, stream-scoped append-only log with
//!   per-stream monotone versions, conditional writes against version
//!   predicates, batch-atomic insertion and duplicate detection
//! - **Subscription model**: position-aware, pausable consumers over the
//!   event collection's change stream, with per-subscription durable
//!   positions, competing-consumer lease election and retry-wrapped delivery
//!
//! # Architecture
//!
//! ```text
//! writer ──→ WriteCondition ──→ MongoEventStore ──→ event collection
//!                                                        │
//!                                                   change stream
//!                                                        │
//!                              MongoChangeStreamSubscriptionModel
//!                                                        │
//!                                    DurableSubscriptionModel (position)
//!                                                        │
//!                             CompetingConsumerSubscriptionModel (lease)
//!                                                        │
//!                                                     handler
//! ```
//!
//! # Modules
//!
//! - [`cloudevent`] - The CloudEvent model persisted by the store
//! - [`condition`] - Version predicates for conditional writes
//! - [`config`] - Store and subscription configuration
//! - [`event_store`] - The event store trait and its MongoDB implementation
//! - [`subscription`] - Change-stream subscription models
//! - [`retry`] - Retry strategies for delivery and transient failures
//! - [`errors`] - Error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eventstore_mongodb::cloudevent::CloudEvent;
//! use eventstore_mongodb::event_store::{EventStore, MongoEventStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoEventStore::connect("mongodb://localhost:27017", "events-db").await?;
//!
//!     let event = CloudEvent::new("1", "urn:example", "com.example.name-defined");
//!     store.write("name", vec![event]).await?;
//!
//!     let stream = store.read("name").await?;
//!     assert_eq!(stream.version, 1);
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod cloudevent;
pub mod condition;
pub mod config;
pub mod errors;
pub mod event_store;
pub mod retry;
pub mod subscription;

// Re-export commonly used types
pub use cloudevent::CloudEvent;
pub use condition::{Condition, WriteCondition};
pub use config::{
    CompetingConsumerConfig, EventStoreConfig, StreamConsistencyGuarantee,
    SubscriptionModelConfig, TimeRepresentation,
};
pub use errors::{EventStoreError, EventStoreResult, SubscriptionError, SubscriptionResult};
pub use event_store::{EventStore, EventStream, MongoEventStore};
pub use retry::RetryStrategy;
pub use subscription::{
    CompetingConsumerSubscriptionModel, DurableSubscriptionModel, EventHandler,
    MongoChangeStreamSubscriptionModel, MongoLeaseCompetingConsumerStrategy,
    MongoSubscriptionPositionStorage, PositionAwareCloudEvent, StartAt, Subscription,
    SubscriptionFilter, SubscriptionPosition,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
