//! Subscription Model Integration Tests
//!
//! These tests require a MongoDB replica set (change streams are not
//! available on standalone deployments). Run with `cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eventstore_mongodb::cloudevent::CloudEvent;
use eventstore_mongodb::config::{
    CompetingConsumerConfig, SubscriptionModelConfig, TimeRepresentation,
};
use eventstore_mongodb::event_store::{EventStore, MongoEventStore};
use eventstore_mongodb::subscription::{
    CompetingConsumerSubscriptionModel, DurableSubscriptionModel,
    MongoChangeStreamSubscriptionModel, MongoLeaseCompetingConsumerStrategy,
    MongoSubscriptionPositionStorage, PositionAwareCloudEvent, StartAt, SubscriptionFilter,
};
use mongodb::Database;
use uuid::Uuid;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const STARTUP_DEADLINE: Duration = Duration::from_secs(10);
const DELIVERY_DEADLINE: Duration = Duration::from_secs(15);

fn mongodb_uri() -> String {
    std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

async fn store_and_db() -> Result<(MongoEventStore, Database), Box<dyn std::error::Error>> {
    let store = MongoEventStore::connect(&mongodb_uri(), "eventstore-sub-it").await?;
    let db = store.database().clone();
    Ok((store, db))
}

fn base_model(db: &Database) -> Arc<MongoChangeStreamSubscriptionModel> {
    Arc::new(MongoChangeStreamSubscriptionModel::new(
        db.clone(),
        "events",
        TimeRepresentation::Rfc3339String,
        SubscriptionModelConfig::default(),
    ))
}

fn durable_model(db: &Database) -> DurableSubscriptionModel {
    DurableSubscriptionModel::new(
        base_model(db),
        MongoSubscriptionPositionStorage::new(db, "subscription-positions"),
    )
}

async fn competing_model(
    db: &Database,
    lease_ttl: Duration,
) -> Result<CompetingConsumerSubscriptionModel, Box<dyn std::error::Error>> {
    let strategy = MongoLeaseCompetingConsumerStrategy::new(
        db,
        CompetingConsumerConfig {
            lease_ttl,
            ..CompetingConsumerConfig::default()
        },
    )
    .await?;

    Ok(CompetingConsumerSubscriptionModel::new(Arc::new(durable_model(db)), Arc::new(strategy)).await)
}

/// Handler recording the ids of delivered events.
fn recording_handler(
    seen: Arc<Mutex<Vec<String>>>,
) -> impl Fn(PositionAwareCloudEvent) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
       + Send
       + Sync
       + 'static {
    move |event: PositionAwareCloudEvent| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            seen.lock().unwrap().push(event.cloud_event.id);
            Ok(())
        })
    }
}

async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn test_event(event_type: &str) -> CloudEvent {
    CloudEvent::new(
        Uuid::now_v7().to_string(),
        "urn:eventstore:subscription-test",
        event_type,
    )
    .with_time(chrono::Utc::now())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn subscription_delivers_written_events_in_order() -> TestResult {
    let (store, db) = store_and_db().await?;
    let model = base_model(&db);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = model
        .subscribe(
            &Uuid::now_v7().to_string(),
            None,
            StartAt::Now,
            recording_handler(Arc::clone(&seen)),
        )
        .await?;

    assert!(subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let first = test_event("com.example.name-defined");
    let second = test_event("com.example.name-was-changed");
    store.write(&stream_id, vec![first.clone()]).await?;
    store.write(&stream_id, vec![second.clone()]).await?;

    assert!(wait_for(DELIVERY_DEADLINE, || seen.lock().unwrap().len() >= 2).await);
    assert_eq!(*seen.lock().unwrap(), vec![first.id, second.id]);

    model.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn filter_admits_only_matching_events() -> TestResult {
    let (store, db) = store_and_db().await?;
    let model = base_model(&db);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = model
        .subscribe(
            &Uuid::now_v7().to_string(),
            Some(SubscriptionFilter::new().with_type("com.example.name-defined")),
            StartAt::Now,
            recording_handler(Arc::clone(&seen)),
        )
        .await?;
    assert!(subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let admitted = test_event("com.example.name-defined");
    let filtered_out = test_event("com.example.name-was-changed");
    store
        .write(&stream_id, vec![filtered_out, admitted.clone()])
        .await?;

    assert!(wait_for(DELIVERY_DEADLINE, || !seen.lock().unwrap().is_empty()).await);

    // Give the excluded event a chance to show up before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*seen.lock().unwrap(), vec![admitted.id]);

    model.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn restarted_durable_subscription_does_not_redeliver() -> TestResult {
    let (store, db) = store_and_db().await?;
    let subscription_id = Uuid::now_v7().to_string();
    let positions = MongoSubscriptionPositionStorage::new(&db, "subscription-positions");

    // First incarnation observes the first event.
    let first_model = durable_model(&db);
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = first_model
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&first_seen)),
        )
        .await?;
    assert!(subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let first_event = test_event("com.example.name-defined");
    store.write(&stream_id, vec![first_event.clone()]).await?;

    assert!(wait_for(DELIVERY_DEADLINE, || !first_seen.lock().unwrap().is_empty()).await);

    // The position is persisted after the handler returns; wait for it
    // before simulating the crash.
    let mut stored = positions.read(&subscription_id).await?;
    let deadline = Instant::now() + DELIVERY_DEADLINE;
    while stored.is_none() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stored = positions.read(&subscription_id).await?;
    }
    assert!(stored.is_some(), "position must be persisted after delivery");

    first_model.shutdown().await;

    // Second incarnation resumes from the stored position.
    let second_model = durable_model(&db);
    let second_seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = second_model
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&second_seen)),
        )
        .await?;
    assert!(subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let second_event = test_event("com.example.name-was-changed");
    store.write(&stream_id, vec![second_event.clone()]).await?;

    assert!(wait_for(DELIVERY_DEADLINE, || !second_seen.lock().unwrap().is_empty()).await);

    let observed = second_seen.lock().unwrap().clone();
    assert!(observed.contains(&second_event.id));
    assert!(
        !observed.contains(&first_event.id),
        "the first event must not be redelivered"
    );

    second_model.cancel_subscription(&subscription_id).await?;
    second_model.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn paused_subscription_resumes_from_stored_position() -> TestResult {
    let (store, db) = store_and_db().await?;
    let subscription_id = Uuid::now_v7().to_string();

    let model = durable_model(&db);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = model
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&seen)),
        )
        .await?;
    assert!(subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let before_pause = test_event("com.example.name-defined");
    store.write(&stream_id, vec![before_pause.clone()]).await?;
    assert!(wait_for(DELIVERY_DEADLINE, || !seen.lock().unwrap().is_empty()).await);

    model.pause_subscription(&subscription_id).await?;

    let while_paused = test_event("com.example.name-was-changed");
    store.write(&stream_id, vec![while_paused.clone()]).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(seen.lock().unwrap().len(), 1, "paused subscriptions do not deliver");

    model.resume_subscription(&subscription_id).await?;

    // The event written while paused arrives after resuming.
    assert!(wait_for(DELIVERY_DEADLINE, || seen.lock().unwrap().len() >= 2).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![before_pause.id, while_paused.id]
    );

    model.cancel_subscription(&subscription_id).await?;
    model.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn competing_consumers_deliver_each_event_exactly_once() -> TestResult {
    let (store, db) = store_and_db().await?;
    let subscription_id = Uuid::now_v7().to_string();

    let first = competing_model(&db, Duration::from_secs(20)).await?;
    let second = competing_model(&db, Duration::from_secs(20)).await?;

    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));

    let first_subscription = first
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&first_seen)),
        )
        .await?;
    second
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&second_seen)),
        )
        .await?;

    // Exactly one replica holds the lease; the first subscriber wins.
    assert!(first_subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let mut written = Vec::new();
    for _ in 0..10 {
        let event = test_event("com.example.name-was-changed");
        written.push(event.id.clone());
        store.write(&stream_id, vec![event]).await?;
    }

    assert!(
        wait_for(DELIVERY_DEADLINE, || {
            first_seen.lock().unwrap().len() + second_seen.lock().unwrap().len() >= 10
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    let first_count = first_seen.lock().unwrap().len();
    let second_count = second_seen.lock().unwrap().len();
    assert_eq!(first_count + second_count, 10, "each event delivered exactly once");
    assert!(
        first_count == 0 || second_count == 0,
        "without a handover only one replica delivers"
    );

    let mut observed: Vec<String> = first_seen.lock().unwrap().clone();
    observed.extend(second_seen.lock().unwrap().clone());
    assert_eq!(observed, written, "events arrive in append order");

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn lease_handover_moves_delivery_to_the_surviving_replica() -> TestResult {
    let (store, db) = store_and_db().await?;
    let subscription_id = Uuid::now_v7().to_string();
    let lease_ttl = Duration::from_secs(3);

    let leader = competing_model(&db, lease_ttl).await?;
    let follower = competing_model(&db, lease_ttl).await?;

    let leader_seen = Arc::new(Mutex::new(Vec::new()));
    let follower_seen = Arc::new(Mutex::new(Vec::new()));

    let leader_subscription = leader
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&leader_seen)),
        )
        .await?;
    let follower_subscription = follower
        .subscribe(
            &subscription_id,
            None,
            StartAt::Default,
            recording_handler(Arc::clone(&follower_seen)),
        )
        .await?;

    assert!(leader_subscription.wait_until_started_timeout(STARTUP_DEADLINE).await);

    let stream_id = Uuid::now_v7().to_string();
    let before = test_event("com.example.name-defined");
    store.write(&stream_id, vec![before.clone()]).await?;
    assert!(wait_for(DELIVERY_DEADLINE, || !leader_seen.lock().unwrap().is_empty()).await);

    // Shutting the leader down releases the lease; the follower's heartbeat
    // takes over and its paused subscription starts.
    leader.shutdown().await;
    assert!(
        follower_subscription
            .wait_until_started_timeout(lease_ttl + STARTUP_DEADLINE)
            .await,
        "follower must take over after the lease is released"
    );

    let after = test_event("com.example.name-was-changed");
    store.write(&stream_id, vec![after.clone()]).await?;

    assert!(wait_for(DELIVERY_DEADLINE, || {
        follower_seen.lock().unwrap().contains(&after.id)
    })
    .await);
    assert!(
        !follower_seen.lock().unwrap().contains(&before.id),
        "the follower resumes from the durably stored position"
    );

    follower.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires MongoDB replica set
async fn wait_until_started_times_out_for_paused_subscription() -> TestResult {
    let (_store, db) = store_and_db().await?;
    let model = base_model(&db);

    let subscription = model
        .subscribe_paused(
            &Uuid::now_v7().to_string(),
            None,
            StartAt::Now,
            |_event: PositionAwareCloudEvent| async move { anyhow::Ok(()) },
        )
        .await?;

    assert!(
        !subscription
            .wait_until_started_timeout(Duration::from_millis(300))
            .await
    );

    model.shutdown().await;
    Ok(())
}
