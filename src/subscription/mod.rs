//! Durable change-stream subscriptions
//!
//! This module turns the event collection's MongoDB change stream into a
//! position-aware, filterable, resumable feed of CloudEvents with
//! at-least-once delivery.
//!
//! # Architecture
//!
//! The subscription models compose as decorators around the raw change feed:
//!
//! ```text
//! CompetingConsumerSubscriptionModel      (lease election across replicas)
//!         │
//! DurableSubscriptionModel                (persists position per subscription)
//!         │
//! MongoChangeStreamSubscriptionModel      (change stream + lifecycle)
//!         │
//!    event collection change stream
//! ```
//!
//! Each delivered event carries the change stream's resume token so the
//! consumer can continue exactly where it left off. Position is persisted
//! strictly after a successful handler return, so handlers must be
//! idempotent.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventstore_mongodb::config::{SubscriptionModelConfig, TimeRepresentation};
//! use eventstore_mongodb::subscription::{
//!     MongoChangeStreamSubscriptionModel, PositionAwareCloudEvent, StartAt,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//!     let model = MongoChangeStreamSubscriptionModel::new(
//!         client.database("events-db"),
//!         "events",
//!         TimeRepresentation::Rfc3339String,
//!         SubscriptionModelConfig::default(),
//!     );
//!
//!     let subscription = model
//!         .subscribe("my-subscription", None, StartAt::Now, |event: PositionAwareCloudEvent| {
//!             async move {
//!                 println!("saw {}", event.cloud_event.id);
//!                 anyhow::Ok(())
//!             }
//!         })
//!         .await?;
//!
//!     subscription.wait_until_started().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use mongodb::bson::{Document, Timestamp};
use mongodb::change_stream::event::ResumeToken;
use tokio::sync::watch;

use crate::cloudevent::CloudEvent;
use crate::errors::SubscriptionResult;
use crate::event_store::document::fields;

pub mod change_feed;
pub mod competing;
pub mod durable;
pub mod position_storage;

pub use change_feed::MongoChangeStreamSubscriptionModel;
pub use competing::{CompetingConsumerSubscriptionModel, MongoLeaseCompetingConsumerStrategy};
pub use durable::DurableSubscriptionModel;
pub use position_storage::MongoSubscriptionPositionStorage;

/// An opaque, resumable position in the change feed
#[derive(Debug, Clone)]
pub enum SubscriptionPosition {
    /// The change stream's own cursor
    ResumeToken(ResumeToken),

    /// Server operation time; used for initial "now" starts before any
    /// event has been observed
    OperationTime(Timestamp),
}

/// Supplier resolved on each subscribe/resume call
pub type StartAtSupplier =
    Arc<dyn Fn() -> BoxFuture<'static, SubscriptionResult<StartAt>> + Send + Sync>;

/// Where a subscription starts consuming the change feed
#[derive(Clone)]
pub enum StartAt {
    /// The server's current operation time at subscribe time
    Now,

    /// Delegate the decision to the enclosing subscription model; the
    /// durable model resolves this to the stored position, falling back to
    /// [`StartAt::Now`]
    Default,

    /// Resume at a specific position
    Position(SubscriptionPosition),

    /// Re-resolved on every subscribe and resume, so a position stored
    /// concurrently by another instance is honored
    Dynamic(StartAtSupplier),
}

impl fmt::Debug for StartAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAt::Now => f.write_str("Now"),
            StartAt::Default => f.write_str("Default"),
            StartAt::Position(p) => f.debug_tuple("Position").field(p).finish(),
            StartAt::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A CloudEvent delivered by a subscription, together with the position to
/// resume after it
#[derive(Debug, Clone)]
pub struct PositionAwareCloudEvent {
    /// The delivered event
    pub cloud_event: CloudEvent,

    /// The stream the event was appended to
    pub stream_id: String,

    /// Resume position pointing past this event
    pub position: SubscriptionPosition,
}

/// Conjunctive filter over the delivered events
///
/// An empty filter admits every event. This is deliberately a small,
/// semantic surface; a full query DSL is out of scope.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    stream_id: Option<String>,
    source: Option<String>,
    event_type: Option<String>,
    subject: Option<String>,
}

impl SubscriptionFilter {
    /// A filter that admits every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit only events appended to this stream.
    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Admit only events from this source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Admit only events of this type.
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Admit only events with this subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The `fullDocument` constraints for the change stream's `$match` stage.
    pub(crate) fn to_match_document(&self) -> Document {
        let mut matcher = Document::new();

        let constraints = [
            (fields::STREAM_ID, &self.stream_id),
            (fields::SOURCE, &self.source),
            (fields::TYPE, &self.event_type),
            (fields::SUBJECT, &self.subject),
        ];

        for (field, value) in constraints {
            if let Some(value) = value {
                matcher.insert(format!("fullDocument.{field}"), value);
            }
        }

        matcher
    }
}

/// Handler invoked for each delivered event
///
/// Handlers for the same subscription id are invoked serially and in
/// change-stream order. Delivery is at-least-once: a handler may observe the
/// same event again after a crash or a lease handover, and must be
/// idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivered event.
    async fn handle(&self, event: PositionAwareCloudEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(PositionAwareCloudEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: PositionAwareCloudEvent) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Handle to a registered subscription
///
/// Returned by `subscribe`; used to block until the change stream is live.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    started: watch::Receiver<bool>,
}

impl Subscription {
    pub(crate) fn new(id: String, started: watch::Receiver<bool>) -> Self {
        Self { id, started }
    }

    /// The subscription id this handle refers to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until the change stream backing this subscription is open.
    ///
    /// Returns `false` if the subscription terminated before it ever
    /// started.
    pub async fn wait_until_started(&self) -> bool {
        let mut started = self.started.clone();
        loop {
            if *started.borrow() {
                return true;
            }
            if started.changed().await.is_err() {
                return *started.borrow();
            }
        }
    }

    /// Wait until the subscription is started, giving up after `timeout`.
    ///
    /// Returns whether the subscription became ready in time.
    pub async fn wait_until_started_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_until_started())
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(SubscriptionFilter::new().to_match_document(), doc! {});
    }

    #[test]
    fn filter_constrains_full_document_fields() {
        let filter = SubscriptionFilter::new()
            .with_stream_id("name")
            .with_type("com.example.name-defined");

        assert_eq!(
            filter.to_match_document(),
            doc! {
                "fullDocument.streamId": "name",
                "fullDocument.type": "com.example.name-defined",
            }
        );
    }

    #[tokio::test]
    async fn wait_until_started_opens_with_the_latch() {
        let (tx, rx) = watch::channel(false);
        let subscription = Subscription::new("sub".to_string(), rx);

        assert!(
            !subscription
                .wait_until_started_timeout(Duration::from_millis(10))
                .await
        );

        tx.send_replace(true);
        assert!(subscription.wait_until_started().await);
    }

    #[tokio::test]
    async fn wait_until_started_reports_terminated_subscription() {
        let (tx, rx) = watch::channel(false);
        let subscription = Subscription::new("sub".to_string(), rx);

        drop(tx);
        assert!(!subscription.wait_until_started().await);
    }
}
