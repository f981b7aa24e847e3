//! Durable subscription model
//!
//! Decorates [`MongoChangeStreamSubscriptionModel`] with persistent,
//! per-subscription positions:
//!
//! - after every successful handler return the delivered position is saved;
//! - [`StartAt::Default`] resolves to the stored position (falling back to
//!   "now"), re-read on every resume so a position stored concurrently by
//!   another instance is honored;
//! - a failed delivery never advances the position, making delivery
//!   at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::errors::SubscriptionResult;
use crate::subscription::change_feed::MongoChangeStreamSubscriptionModel;
use crate::subscription::position_storage::MongoSubscriptionPositionStorage;
use crate::subscription::{
    EventHandler, PositionAwareCloudEvent, StartAt, Subscription, SubscriptionFilter,
};

/// Subscription model that persists the position of each subscription
pub struct DurableSubscriptionModel {
    delegate: Arc<MongoChangeStreamSubscriptionModel>,
    storage: Arc<MongoSubscriptionPositionStorage>,
}

impl DurableSubscriptionModel {
    /// Decorate `delegate` with position persistence in `storage`.
    pub fn new(
        delegate: Arc<MongoChangeStreamSubscriptionModel>,
        storage: MongoSubscriptionPositionStorage,
    ) -> Self {
        Self {
            delegate,
            storage: Arc::new(storage),
        }
    }

    /// Register a subscription and start consuming the change feed.
    ///
    /// With [`StartAt::Default`] the subscription resumes from its stored
    /// position; a subscription seen for the first time starts at "now".
    pub async fn subscribe<H>(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        handler: H,
    ) -> SubscriptionResult<Subscription>
    where
        H: EventHandler + 'static,
    {
        self.register(subscription_id, filter, start_at, Arc::new(handler), false)
            .await
    }

    /// Register a subscription without starting it; see
    /// [`MongoChangeStreamSubscriptionModel::subscribe_paused`].
    pub async fn subscribe_paused<H>(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        handler: H,
    ) -> SubscriptionResult<Subscription>
    where
        H: EventHandler + 'static,
    {
        self.register(subscription_id, filter, start_at, Arc::new(handler), true)
            .await
    }

    pub(crate) async fn register(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        handler: Arc<dyn EventHandler>,
        paused: bool,
    ) -> SubscriptionResult<Subscription> {
        let start_at = self.durable_start_at(subscription_id, start_at);

        let persisting = Arc::new(PositionPersistingHandler {
            subscription_id: subscription_id.to_string(),
            inner: handler,
            storage: Arc::clone(&self.storage),
        });

        self.delegate
            .register(subscription_id, filter, start_at, persisting, paused)
            .await
    }

    /// Pause a running subscription; its stored position is left untouched.
    pub async fn pause_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        self.delegate.pause_subscription(subscription_id).await
    }

    /// Resume a paused subscription from its stored position.
    pub async fn resume_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        self.delegate.resume_subscription(subscription_id).await
    }

    /// Cancel a subscription and delete its stored position.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        self.delegate.cancel_subscription(subscription_id).await?;
        self.storage.delete(subscription_id).await?;

        debug!(subscription = subscription_id, "stored position deleted");
        Ok(())
    }

    /// Start the model after a [`stop`](Self::stop).
    pub async fn start(&self) -> SubscriptionResult<()> {
        self.delegate.start().await
    }

    /// Stop every running subscription while keeping registrations and
    /// stored positions.
    pub async fn stop(&self) -> SubscriptionResult<()> {
        self.delegate.stop().await
    }

    /// Shut the model down. Terminal.
    pub async fn shutdown(&self) {
        self.delegate.shutdown().await;
    }

    pub(crate) async fn is_registered(&self, subscription_id: &str) -> bool {
        self.delegate.is_registered(subscription_id).await
    }

    /// Turn [`StartAt::Default`] into a dynamic lookup of the stored
    /// position, so every (re)subscribe re-reads it.
    fn durable_start_at(&self, subscription_id: &str, start_at: StartAt) -> StartAt {
        match start_at {
            StartAt::Default => {
                let storage = Arc::clone(&self.storage);
                let subscription_id = subscription_id.to_string();

                StartAt::Dynamic(Arc::new(move || {
                    let storage = Arc::clone(&storage);
                    let subscription_id = subscription_id.clone();

                    async move {
                        Ok(match storage.read(&subscription_id).await? {
                            Some(position) => StartAt::Position(position),
                            None => StartAt::Now,
                        })
                    }
                    .boxed()
                }))
            }
            other => other,
        }
    }
}

/// Handler decorator persisting the position after each successful delivery
struct PositionPersistingHandler {
    subscription_id: String,
    inner: Arc<dyn EventHandler>,
    storage: Arc<MongoSubscriptionPositionStorage>,
}

#[async_trait]
impl EventHandler for PositionPersistingHandler {
    async fn handle(&self, event: PositionAwareCloudEvent) -> anyhow::Result<()> {
        let position = event.position.clone();

        self.inner.handle(event).await?;
        self.storage.save(&self.subscription_id, &position).await?;

        Ok(())
    }
}
