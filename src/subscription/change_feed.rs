//! Change-stream subscription model
//!
//! [`MongoChangeStreamSubscriptionModel`] wraps the event collection's
//! change stream into per-subscription consumer tasks. Each delivered event
//! carries the stream's resume token; decorators
//! ([`DurableSubscriptionModel`](crate::subscription::DurableSubscriptionModel),
//! [`CompetingConsumerSubscriptionModel`](crate::subscription::CompetingConsumerSubscriptionModel))
//! build durability and mutual exclusion on top of this model.
//!
//! One consumer task runs per subscription; handlers for a subscription are
//! invoked serially and in change-stream order. Cancellation is cooperative:
//! an in-flight handler invocation completes, nothing new starts after the
//! cancel is observed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::error::ErrorKind;
use mongodb::options::ChangeStreamOptions;
use mongodb::{Collection, Database};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SubscriptionModelConfig, TimeRepresentation};
use crate::errors::{SubscriptionError, SubscriptionResult};
use crate::event_store::document;
use crate::retry::RetryStrategy;
use crate::subscription::{
    EventHandler, PositionAwareCloudEvent, StartAt, Subscription, SubscriptionFilter,
    SubscriptionPosition,
};

/// Delay before reopening the change stream after a transient failure
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type EventChangeStream = ChangeStream<ChangeStreamEvent<Document>>;

/// Subscription model consuming the event collection's change stream
///
/// Owns the registries of running and paused subscriptions and the consumer
/// task of each running one. All lifecycle operations are serialized by an
/// internal mutex.
pub struct MongoChangeStreamSubscriptionModel {
    db: Database,
    events: Collection<Document>,
    time_representation: TimeRepresentation,
    config: SubscriptionModelConfig,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionEntry>>>,
    shutdown: Arc<AtomicBool>,
}

#[derive(Clone)]
struct SubscriptionParams {
    id: String,
    filter: Option<SubscriptionFilter>,
    start_at: StartAt,
    handler: Arc<dyn EventHandler>,
}

struct SubscriptionEntry {
    params: SubscriptionParams,
    started: Arc<watch::Sender<bool>>,
    worker: Option<Worker>,
    paused_by_stop: bool,
}

struct Worker {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MongoChangeStreamSubscriptionModel {
    /// Create a subscription model over the given event collection.
    pub fn new(
        db: Database,
        event_collection: &str,
        time_representation: TimeRepresentation,
        config: SubscriptionModelConfig,
    ) -> Self {
        let events = db.collection::<Document>(event_collection);

        Self {
            db,
            events,
            time_representation,
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a subscription and start consuming the change feed.
    ///
    /// `start_at` decides where consumption begins; at this level
    /// [`StartAt::Default`] means [`StartAt::Now`].
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

    /// Register a subscription without starting it.
    ///
    /// Used by the competing-consumer decorator to hold a subscription ready
    /// until the lease is granted; [`resume_subscription`](Self::resume_subscription)
    /// starts it.
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
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SubscriptionError::ModelShutDown);
        }

        let mut subscriptions = self.subscriptions.lock().await;

        if subscriptions.contains_key(subscription_id) {
            return Err(SubscriptionError::SubscriptionAlreadyExists(
                subscription_id.to_string(),
            ));
        }

        let (started_tx, started_rx) = watch::channel(false);
        let started = Arc::new(started_tx);

        let params = SubscriptionParams {
            id: subscription_id.to_string(),
            filter,
            start_at,
            handler,
        };

        let worker = if paused {
            None
        } else {
            Some(self.spawn_worker(params.clone(), Arc::clone(&started)))
        };

        subscriptions.insert(
            subscription_id.to_string(),
            SubscriptionEntry {
                params,
                started,
                worker,
                paused_by_stop: false,
            },
        );

        debug!(subscription = subscription_id, paused, "subscription registered");
        Ok(Subscription::new(subscription_id.to_string(), started_rx))
    }

    /// Pause a running subscription, keeping its registration.
    ///
    /// The in-flight handler invocation (if any) completes before this
    /// returns. Fails with
    /// [`SubscriptionNotRunning`](SubscriptionError::SubscriptionNotRunning)
    /// when the subscription is unknown or already paused.
    pub async fn pause_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        let worker = {
            let mut subscriptions = self.subscriptions.lock().await;
            let entry = subscriptions.get_mut(subscription_id).ok_or_else(|| {
                SubscriptionError::SubscriptionNotRunning(subscription_id.to_string())
            })?;

            entry.worker.take().ok_or_else(|| {
                SubscriptionError::SubscriptionNotRunning(subscription_id.to_string())
            })?
        };

        stop_worker(worker).await;

        debug!(subscription = subscription_id, "subscription paused");
        Ok(())
    }

    /// Resume a paused subscription.
    ///
    /// The start position is re-resolved, so a [`StartAt::Dynamic`] supplier
    /// is consulted again. Resuming a running subscription is a no-op; an
    /// unknown subscription fails with
    /// [`SubscriptionNotRunning`](SubscriptionError::SubscriptionNotRunning).
    pub async fn resume_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        let entry = subscriptions.get_mut(subscription_id).ok_or_else(|| {
            SubscriptionError::SubscriptionNotRunning(subscription_id.to_string())
        })?;

        if entry.worker.is_none() {
            entry.worker = Some(self.spawn_worker(entry.params.clone(), Arc::clone(&entry.started)));
            entry.paused_by_stop = false;
            debug!(subscription = subscription_id, "subscription resumed");
        }

        Ok(())
    }

    /// Cancel a subscription, removing its registration.
    ///
    /// Cancelling an unknown subscription is a no-op.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> SubscriptionResult<()> {
        let entry = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.remove(subscription_id)
        };

        if let Some(entry) = entry {
            if let Some(worker) = entry.worker {
                stop_worker(worker).await;
            }
            debug!(subscription = subscription_id, "subscription cancelled");
        }

        Ok(())
    }

    /// Start the model after a [`stop`](Self::stop), resuming the
    /// subscriptions that `stop` paused.
    ///
    /// Starting an already running model is a no-op; a shut-down model fails
    /// with [`ModelShutDown`](SubscriptionError::ModelShutDown).
    pub async fn start(&self) -> SubscriptionResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SubscriptionError::ModelShutDown);
        }

        let mut subscriptions = self.subscriptions.lock().await;
        for entry in subscriptions.values_mut() {
            if entry.paused_by_stop && entry.worker.is_none() {
                entry.worker =
                    Some(self.spawn_worker(entry.params.clone(), Arc::clone(&entry.started)));
                entry.paused_by_stop = false;
            }
        }

        Ok(())
    }

    /// Stop every running subscription while keeping all registrations.
    pub async fn stop(&self) -> SubscriptionResult<()> {
        let workers = {
            let mut subscriptions = self.subscriptions.lock().await;
            let mut workers = Vec::new();
            for entry in subscriptions.values_mut() {
                if let Some(worker) = entry.worker.take() {
                    entry.paused_by_stop = true;
                    workers.push(worker);
                }
            }
            workers
        };

        for worker in workers {
            stop_worker(worker).await;
        }

        Ok(())
    }

    /// Shut the model down. Terminal: no operation is accepted afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let entries: Vec<SubscriptionEntry> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            if let Some(worker) = entry.worker {
                stop_worker(worker).await;
            }
        }

        info!("subscription model shut down");
    }

    pub(crate) async fn is_registered(&self, subscription_id: &str) -> bool {
        self.subscriptions.lock().await.contains_key(subscription_id)
    }

    fn spawn_worker(&self, params: SubscriptionParams, started: Arc<watch::Sender<bool>>) -> Worker {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = WorkerContext {
            db: self.db.clone(),
            events: self.events.clone(),
            time_representation: self.time_representation,
            retry: self.config.retry.clone(),
            restart_on_history_lost: self.config.restart_on_change_stream_history_lost,
            params,
            started,
            cancel: cancel_rx,
            shutdown: Arc::clone(&self.shutdown),
        };

        Worker {
            cancel: cancel_tx,
            task: tokio::spawn(run_change_stream(ctx)),
        }
    }
}

async fn stop_worker(worker: Worker) {
    let _ = worker.cancel.send(true);
    let _ = worker.task.await;
}

struct WorkerContext {
    db: Database,
    events: Collection<Document>,
    time_representation: TimeRepresentation,
    retry: RetryStrategy,
    restart_on_history_lost: bool,
    params: SubscriptionParams,
    started: Arc<watch::Sender<bool>>,
    cancel: watch::Receiver<bool>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    fn aborted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || *self.cancel.borrow()
    }
}

async fn run_change_stream(mut ctx: WorkerContext) {
    let subscription = ctx.params.id.clone();
    let mut next_start = ctx.params.start_at.clone();

    'restart: loop {
        if ctx.aborted() {
            break;
        }

        let position = match resolve_start_at(&ctx.db, next_start.clone()).await {
            Ok(position) => position,
            Err(error) => {
                warn!(%subscription, %error, "failed to resolve start position");
                if sleep_or_cancel(&mut ctx.cancel, RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
        };

        let mut stream = match open_change_stream(&ctx, &position).await {
            Ok(stream) => stream,
            Err(error) if is_history_lost(&error) => {
                if handle_history_lost(&subscription, ctx.restart_on_history_lost, &mut next_start)
                {
                    continue;
                }
                break;
            }
            Err(error) => {
                warn!(%subscription, %error, "failed to open change stream");
                if sleep_or_cancel(&mut ctx.cancel, RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
        };

        ctx.started.send_replace(true);
        info!(%subscription, "subscription started");

        loop {
            if ctx.aborted() {
                break 'restart;
            }

            let next = tokio::select! {
                _ = ctx.cancel.changed() => break 'restart,
                next = stream.next_if_any() => next,
            };

            match next {
                Ok(Some(change)) => {
                    let Some(token) = stream.resume_token() else {
                        continue;
                    };
                    let delivered_position = SubscriptionPosition::ResumeToken(token);
                    next_start = StartAt::Position(delivered_position.clone());

                    if let Err(error) = deliver(&ctx, change, delivered_position).await {
                        if !ctx.aborted() {
                            error!(%subscription, %error, "event delivery failed, stopping subscription");
                        }
                        break 'restart;
                    }
                }
                Ok(None) => {
                    // Quiet batch; the post-batch token still moves forward.
                    if let Some(token) = stream.resume_token() {
                        next_start = StartAt::Position(SubscriptionPosition::ResumeToken(token));
                    }
                }
                Err(error) if is_history_lost(&error) => {
                    ctx.started.send_replace(false);
                    if handle_history_lost(
                        &subscription,
                        ctx.restart_on_history_lost,
                        &mut next_start,
                    ) {
                        continue 'restart;
                    }
                    break 'restart;
                }
                Err(error) => {
                    ctx.started.send_replace(false);
                    warn!(%subscription, %error, "change stream failed, reconnecting");
                    if sleep_or_cancel(&mut ctx.cancel, RECONNECT_DELAY).await {
                        break 'restart;
                    }
                    continue 'restart;
                }
            }
        }
    }

    ctx.started.send_replace(false);
    debug!(%subscription, "subscription worker stopped");
}

/// Returns whether the subscription should restart from "now".
fn handle_history_lost(
    subscription: &str,
    restart_on_history_lost: bool,
    next_start: &mut StartAt,
) -> bool {
    if restart_on_history_lost {
        warn!(%subscription, "change stream history lost, restarting from now");
        *next_start = StartAt::Now;
        true
    } else {
        let error = SubscriptionError::CatchupImpossible(subscription.to_string());
        error!(%subscription, %error, "stopping subscription");
        false
    }
}

async fn deliver(
    ctx: &WorkerContext,
    change: ChangeStreamEvent<Document>,
    position: SubscriptionPosition,
) -> SubscriptionResult<()> {
    let Some(document) = change.full_document else {
        return Ok(());
    };

    let stream_id = match document::stream_id_of(&document) {
        Ok(stream_id) => stream_id,
        Err(error) => {
            warn!(subscription = %ctx.params.id, %error, "skipping malformed change event");
            return Ok(());
        }
    };

    let cloud_event = match document::from_document(&document, ctx.time_representation) {
        Ok(event) => event,
        Err(error) => {
            warn!(subscription = %ctx.params.id, %error, "skipping malformed change event");
            return Ok(());
        }
    };

    let event = PositionAwareCloudEvent {
        cloud_event,
        stream_id,
        position,
    };

    let handler = &ctx.params.handler;
    ctx.retry
        .execute_with(
            || {
                let event = event.clone();
                async move { handler.handle(event).await }
            },
            |_| true,
            || ctx.aborted(),
        )
        .await
        .map_err(SubscriptionError::Handler)
}

async fn open_change_stream(
    ctx: &WorkerContext,
    position: &SubscriptionPosition,
) -> mongodb::error::Result<EventChangeStream> {
    let mut match_stage = doc! { "operationType": "insert" };
    if let Some(filter) = &ctx.params.filter {
        match_stage.extend(filter.to_match_document());
    }

    let options = match position {
        SubscriptionPosition::ResumeToken(token) => ChangeStreamOptions::builder()
            .start_after(Some(token.clone()))
            .build(),
        SubscriptionPosition::OperationTime(time) => ChangeStreamOptions::builder()
            .start_at_operation_time(Some(*time))
            .build(),
    };

    ctx.events
        .watch()
        .pipeline(vec![doc! { "$match": match_stage }])
        .with_options(options)
        .await
}

/// Resolve a [`StartAt`] into a concrete position, consulting `Dynamic`
/// suppliers until one yields a concrete variant.
pub(crate) async fn resolve_start_at(
    db: &Database,
    start_at: StartAt,
) -> SubscriptionResult<SubscriptionPosition> {
    let mut current = start_at;
    loop {
        match current {
            StartAt::Now | StartAt::Default => {
                return Ok(SubscriptionPosition::OperationTime(
                    current_operation_time(db).await?,
                ));
            }
            StartAt::Position(position) => return Ok(position),
            StartAt::Dynamic(supplier) => current = supplier().await?,
        }
    }
}

/// The server's current operation time, advanced by one increment so that a
/// subscription started right after a write does not replay that write.
pub(crate) async fn current_operation_time(db: &Database) -> SubscriptionResult<Timestamp> {
    let reply = db.run_command(doc! { "hello": 1 }).await?;

    match reply.get("operationTime") {
        Some(Bson::Timestamp(time)) => Ok(Timestamp {
            time: time.time,
            increment: time.increment + 1,
        }),
        _ => Err(SubscriptionError::InvalidPosition(
            "server reply carried no operationTime".to_string(),
        )),
    }
}

/// Whether the server reports that the change stream's history has been
/// truncated past our resume position.
fn is_history_lost(error: &mongodb::error::Error) -> bool {
    const CHANGE_STREAM_HISTORY_LOST: i32 = 286;

    matches!(error.kind.as_ref(), ErrorKind::Command(e) if e.code == CHANGE_STREAM_HISTORY_LOST)
}

/// Delay, returning early (and `true`) when the subscription is cancelled.
async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }

    tokio::select! {
        _ = cancel.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::StartAtSupplier;

    // Client construction is offline for mongodb:// URIs; no I/O happens
    // until a subscription worker first opens the change stream.
    async fn offline_db() -> Database {
        mongodb::Client::with_uri_str("mongodb://localhost:27017")
            .await
            .expect("parsing a mongodb:// URI does not contact the server")
            .database("unused")
    }

    #[tokio::test]
    async fn resolve_start_at_unwraps_dynamic_suppliers() {
        let supplier: StartAtSupplier = Arc::new(|| {
            Box::pin(async {
                Ok(StartAt::Position(SubscriptionPosition::OperationTime(
                    Timestamp {
                        time: 7,
                        increment: 3,
                    },
                )))
            })
        });

        let position = resolve_start_at(&offline_db().await, StartAt::Dynamic(supplier))
            .await
            .unwrap();

        match position {
            SubscriptionPosition::OperationTime(time) => {
                assert_eq!(time.time, 7);
                assert_eq!(time.increment, 3);
            }
            other => panic!("unexpected position: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_of_unknown_subscription_fails() {
        let model = MongoChangeStreamSubscriptionModel::new(
            offline_db().await,
            "events",
            TimeRepresentation::Rfc3339String,
            SubscriptionModelConfig::default(),
        );

        let result = model.pause_subscription("unknown").await;

        assert!(matches!(
            result,
            Err(SubscriptionError::SubscriptionNotRunning(id)) if id == "unknown"
        ));
    }

    #[tokio::test]
    async fn cancel_of_unknown_subscription_is_a_no_op() {
        let model = MongoChangeStreamSubscriptionModel::new(
            offline_db().await,
            "events",
            TimeRepresentation::Rfc3339String,
            SubscriptionModelConfig::default(),
        );

        assert!(model.cancel_subscription("unknown").await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let model = MongoChangeStreamSubscriptionModel::new(
            offline_db().await,
            "events",
            TimeRepresentation::Rfc3339String,
            SubscriptionModelConfig::default(),
        );

        model.shutdown().await;

        let result = model
            .subscribe("sub", None, StartAt::Now, |_event: PositionAwareCloudEvent| async move {
                anyhow::Ok(())
            })
            .await;

        assert!(matches!(result, Err(SubscriptionError::ModelShutDown)));

        assert!(matches!(
            model.start().await,
            Err(SubscriptionError::ModelShutDown)
        ));
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let model = MongoChangeStreamSubscriptionModel::new(
            offline_db().await,
            "events",
            TimeRepresentation::Rfc3339String,
            SubscriptionModelConfig::default(),
        );

        let handler = |_event: PositionAwareCloudEvent| async move { anyhow::Ok(()) };

        model
            .subscribe_paused("sub", None, StartAt::Now, handler)
            .await
            .unwrap();

        let result = model.subscribe_paused("sub", None, StartAt::Now, handler).await;

        assert!(matches!(
            result,
            Err(SubscriptionError::SubscriptionAlreadyExists(id)) if id == "sub"
        ));
    }
}
