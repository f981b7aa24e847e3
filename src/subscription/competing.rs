//! Competing-consumer coordination across replicas
//!
//! Multiple instances of an application may register the same subscription
//! id; only the instance holding the lease for that id delivers events.
//! The lease is a single document per subscription id, claimed and renewed
//! with conditional upserts (no locks, no cross-process transactions):
//!
//! ```text
//! { _id: <subscriptionId>, subscriberId: <replica>, expiresAt: <date> }
//! ```
//!
//! A claim succeeds when the document is absent, already ours, or expired;
//! anything else fails the upsert with a duplicate key, which simply means
//! another replica holds the lease. A background heartbeat renews held
//! leases at a third of the TTL and reports transitions as
//! [`CompetingConsumerEvent`] messages, which the
//! [`CompetingConsumerSubscriptionModel`] turns into pause/resume calls on
//! the wrapped durable model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tracing::{debug, info, warn};

use crate::config::CompetingConsumerConfig;
use crate::errors::{SubscriptionError, SubscriptionResult};
use crate::event_store::mongo::is_duplicate_key_error;
use crate::subscription::durable::DurableSubscriptionModel;
use crate::subscription::{EventHandler, StartAt, Subscription, SubscriptionFilter};

const SUBSCRIBER_ID: &str = "subscriberId";
const EXPIRES_AT: &str = "expiresAt";

/// Lease transition observed by the heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompetingConsumerEvent {
    /// This replica now holds the lease and may deliver
    ConsumptionGranted {
        /// The affected subscription id
        subscription_id: String,
    },

    /// This replica lost the lease and must stop delivering
    ConsumptionProhibited {
        /// The affected subscription id
        subscription_id: String,
    },
}

/// Lease-based election of the single consuming replica per subscription id
pub struct MongoLeaseCompetingConsumerStrategy {
    leases: Collection<Document>,
    subscriber_id: String,
    lease_ttl: chrono::Duration,
    registered: Arc<Mutex<HashMap<String, bool>>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<CompetingConsumerEvent>>>,
    shutdown: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl MongoLeaseCompetingConsumerStrategy {
    /// Create a strategy with a fresh replica identity.
    ///
    /// Creates the TTL index on `expiresAt` (so abandoned leases are also
    /// garbage-collected server-side) and starts the renewal heartbeat.
    pub async fn new(
        db: &Database,
        config: CompetingConsumerConfig,
    ) -> SubscriptionResult<Self> {
        let leases = db.collection::<Document>(&config.lease_collection);

        let ttl_index = IndexModel::builder()
            .keys(doc! { EXPIRES_AT: 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::ZERO)
                    .build(),
            )
            .build();
        leases.create_index(ttl_index).await?;

        let subscriber_id = Uuid::now_v7().to_string();
        let lease_ttl = chrono::Duration::milliseconds(config.lease_ttl.as_millis() as i64);
        let registered = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Renew well inside the TTL so a healthy holder never expires.
        let heartbeat_interval = config.lease_ttl / 3;
        let heartbeat = tokio::spawn(run_heartbeat(HeartbeatContext {
            leases: leases.clone(),
            subscriber_id: subscriber_id.clone(),
            lease_ttl,
            interval: heartbeat_interval,
            registered: Arc::clone(&registered),
            event_tx,
            shutdown: Arc::clone(&shutdown),
        }));

        info!(subscriber = %subscriber_id, "competing consumer strategy started");

        Ok(Self {
            leases,
            subscriber_id,
            lease_ttl,
            registered,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown,
            heartbeat,
        })
    }

    /// The identity of this replica.
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Register this replica as a competitor for `subscription_id` and
    /// attempt to claim the lease immediately.
    ///
    /// Returns whether this replica now holds the lease.
    pub async fn register_competing_consumer(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<bool> {
        let acquired =
            try_acquire(&self.leases, subscription_id, &self.subscriber_id, self.lease_ttl)
                .await?;

        self.registered
            .lock()
            .await
            .insert(subscription_id.to_string(), acquired);

        debug!(subscription = subscription_id, acquired, "competing consumer registered");
        Ok(acquired)
    }

    /// Stop competing for `subscription_id`, releasing the lease if held.
    pub async fn unregister_competing_consumer(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<()> {
        let held = self.registered.lock().await.remove(subscription_id);

        if held == Some(true) {
            release(&self.leases, subscription_id, &self.subscriber_id).await?;
        }

        Ok(())
    }

    /// Whether this replica currently holds the lease for `subscription_id`.
    pub async fn has_lock(&self, subscription_id: &str) -> bool {
        self.registered
            .lock()
            .await
            .get(subscription_id)
            .copied()
            .unwrap_or(false)
    }

    /// Release every held lease and stop the heartbeat. Terminal.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.heartbeat.abort();

        let held: Vec<String> = {
            let mut registered = self.registered.lock().await;
            registered
                .drain()
                .filter_map(|(id, held)| held.then_some(id))
                .collect()
        };

        for subscription_id in held {
            if let Err(error) = release(&self.leases, &subscription_id, &self.subscriber_id).await
            {
                warn!(subscription = %subscription_id, %error, "failed to release lease");
            }
        }
    }

    pub(crate) async fn take_event_receiver(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<CompetingConsumerEvent>> {
        self.event_rx.lock().await.take()
    }
}

struct HeartbeatContext {
    leases: Collection<Document>,
    subscriber_id: String,
    lease_ttl: chrono::Duration,
    interval: Duration,
    registered: Arc<Mutex<HashMap<String, bool>>>,
    event_tx: mpsc::UnboundedSender<CompetingConsumerEvent>,
    shutdown: Arc<AtomicBool>,
}

async fn run_heartbeat(ctx: HeartbeatContext) {
    let mut ticker = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let snapshot: Vec<(String, bool)> = {
            let registered = ctx.registered.lock().await;
            registered.iter().map(|(id, held)| (id.clone(), *held)).collect()
        };

        for (subscription_id, held) in snapshot {
            let now_held =
                match try_acquire(&ctx.leases, &subscription_id, &ctx.subscriber_id, ctx.lease_ttl)
                    .await
                {
                    Ok(acquired) => acquired,
                    Err(error) => {
                        // A failed renewal forfeits the lease until the next tick.
                        warn!(subscription = %subscription_id, %error, "lease renewal failed");
                        false
                    }
                };

            if now_held != held {
                let mut registered = ctx.registered.lock().await;
                // The subscription may have been unregistered while we were
                // talking to the server.
                if let Some(entry) = registered.get_mut(&subscription_id) {
                    *entry = now_held;

                    let event = if now_held {
                        CompetingConsumerEvent::ConsumptionGranted {
                            subscription_id: subscription_id.clone(),
                        }
                    } else {
                        CompetingConsumerEvent::ConsumptionProhibited {
                            subscription_id: subscription_id.clone(),
                        }
                    };

                    debug!(subscription = %subscription_id, granted = now_held, "lease transition");
                    let _ = ctx.event_tx.send(event);
                }
            }
        }
    }
}

/// Claim or renew the lease. The filter matches when the lease is ours or
/// expired; when another live holder exists the upsert collides on `_id`
/// with a duplicate key, which means "not acquired".
async fn try_acquire(
    leases: &Collection<Document>,
    subscription_id: &str,
    subscriber_id: &str,
    lease_ttl: chrono::Duration,
) -> SubscriptionResult<bool> {
    let now = Utc::now();
    let expires_at = now + lease_ttl;

    let filter = doc! {
        "_id": subscription_id,
        "$or": [
            { SUBSCRIBER_ID: subscriber_id },
            { EXPIRES_AT: { "$lt": Bson::DateTime(now.into()) } },
        ],
    };
    let update = doc! {
        "$set": {
            SUBSCRIBER_ID: subscriber_id,
            EXPIRES_AT: Bson::DateTime(expires_at.into()),
        },
    };

    match leases.update_one(filter, update).upsert(true).await {
        Ok(_) => Ok(true),
        Err(error) if is_duplicate_key_error(&error) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

async fn release(
    leases: &Collection<Document>,
    subscription_id: &str,
    subscriber_id: &str,
) -> SubscriptionResult<()> {
    leases
        .delete_one(doc! { "_id": subscription_id, SUBSCRIBER_ID: subscriber_id })
        .await?;

    debug!(subscription = subscription_id, "lease released");
    Ok(())
}

/// Subscription model granting delivery to at most one replica per
/// subscription id
///
/// Wraps a [`DurableSubscriptionModel`]; the wrapped subscription runs only
/// while this replica holds the lease. On lease loss the subscription is
/// paused, on (re)acquisition it resumes from the durably stored position,
/// so a handover costs at most one duplicate delivery.
pub struct CompetingConsumerSubscriptionModel {
    delegate: Arc<DurableSubscriptionModel>,
    strategy: Arc<MongoLeaseCompetingConsumerStrategy>,
    listener: JoinHandle<()>,
}

impl CompetingConsumerSubscriptionModel {
    /// Wrap `delegate`, reacting to the lease transitions of `strategy`.
    pub async fn new(
        delegate: Arc<DurableSubscriptionModel>,
        strategy: Arc<MongoLeaseCompetingConsumerStrategy>,
    ) -> Self {
        let mut events = strategy
            .take_event_receiver()
            .await
            .expect("strategy is already driving another subscription model");

        let listener_delegate = Arc::clone(&delegate);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CompetingConsumerEvent::ConsumptionGranted { subscription_id } => {
                        if let Err(error) =
                            listener_delegate.resume_subscription(&subscription_id).await
                        {
                            warn!(subscription = %subscription_id, %error, "failed to resume on lease grant");
                        }
                    }
                    CompetingConsumerEvent::ConsumptionProhibited { subscription_id } => {
                        match listener_delegate.pause_subscription(&subscription_id).await {
                            Ok(()) | Err(SubscriptionError::SubscriptionNotRunning(_)) => {}
                            Err(error) => {
                                warn!(subscription = %subscription_id, %error, "failed to pause on lease loss");
                            }
                        }
                    }
                }
            }
        });

        Self {
            delegate,
            strategy,
            listener,
        }
    }

    /// Register a subscription on this replica.
    ///
    /// The wrapped subscription starts immediately when this replica wins
    /// the lease; otherwise it is held paused until the lease is granted.
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
        // Checked up front so a rejected duplicate cannot release the lease
        // of the existing registration below.
        if self.delegate.is_registered(subscription_id).await {
            return Err(SubscriptionError::SubscriptionAlreadyExists(
                subscription_id.to_string(),
            ));
        }

        let granted = self
            .strategy
            .register_competing_consumer(subscription_id)
            .await?;

        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let result = self
            .delegate
            .register(subscription_id, filter, start_at, handler, !granted)
            .await;

        if result.is_err() {
            self.strategy
                .unregister_competing_consumer(subscription_id)
                .await?;
        }

        result
    }

    /// Stop competing for the subscription and pause local delivery.
    ///
    /// The lease is relinquished so another replica can take over.
    pub async fn pause_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        if !self.delegate.is_registered(subscription_id).await {
            return Err(SubscriptionError::SubscriptionNotRunning(
                subscription_id.to_string(),
            ));
        }

        match self.delegate.pause_subscription(subscription_id).await {
            // Already paused locally because this replica is not the leader.
            Ok(()) | Err(SubscriptionError::SubscriptionNotRunning(_)) => {}
            Err(error) => return Err(error),
        }

        self.strategy
            .unregister_competing_consumer(subscription_id)
            .await
    }

    /// Compete for the subscription again; delivery resumes when (and
    /// where) the lease is won.
    pub async fn resume_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        if !self.delegate.is_registered(subscription_id).await {
            return Err(SubscriptionError::SubscriptionNotRunning(
                subscription_id.to_string(),
            ));
        }

        let granted = self
            .strategy
            .register_competing_consumer(subscription_id)
            .await?;

        if granted {
            self.delegate.resume_subscription(subscription_id).await?;
        }

        Ok(())
    }

    /// Cancel the subscription, releasing the lease and deleting the stored
    /// position.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        self.strategy
            .unregister_competing_consumer(subscription_id)
            .await?;
        self.delegate.cancel_subscription(subscription_id).await
    }

    /// Start the model after a [`stop`](Self::stop).
    pub async fn start(&self) -> SubscriptionResult<()> {
        self.delegate.start().await
    }

    /// Stop local delivery while keeping registrations and leases.
    pub async fn stop(&self) -> SubscriptionResult<()> {
        self.delegate.stop().await
    }

    /// Shut the model down, releasing every held lease. Terminal.
    pub async fn shutdown(&self) {
        self.strategy.shutdown().await;
        self.listener.abort();
        self.delegate.shutdown().await;
    }
}
