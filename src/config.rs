//! Configuration for the event store and the subscription models

use std::time::Duration;

use crate::retry::RetryStrategy;

/// Configuration for a [`MongoEventStore`](crate::event_store::MongoEventStore)
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Collection holding one document per event
    pub event_collection: String,

    /// Consistency guarantee applied to writes and reads
    pub consistency: StreamConsistencyGuarantee,

    /// How event timestamps are persisted and compared
    pub time_representation: TimeRepresentation,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            event_collection: "events".to_string(),
            consistency: StreamConsistencyGuarantee::Transactional {
                stream_version_collection: "stream-version".to_string(),
            },
            time_representation: TimeRepresentation::Rfc3339String,
        }
    }
}

/// Consistency guarantee for stream writes and reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamConsistencyGuarantee {
    /// No stream metadata is kept. The stream version is derived as the
    /// number of persisted events, batch writes are not isolated, and a
    /// duplicate-key failure can leave a prefix of the batch persisted.
    None,

    /// Stream metadata is updated in the same multi-document transaction as
    /// event insertion: batch writes are all-or-nothing, version predicates
    /// are supported, and reads are free of skew between version and events.
    Transactional {
        /// Collection holding one `{_id: streamId, version}` document per stream
        stream_version_collection: String,
    },
}

/// How `time` is persisted in event documents
///
/// Every component that persists or queries by time must use the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepresentation {
    /// RFC 3339 string, preserving full timestamp precision
    Rfc3339String,
    /// BSON date (millisecond precision)
    Date,
}

/// Configuration for the change-stream subscription models
#[derive(Debug, Clone)]
pub struct SubscriptionModelConfig {
    /// When the change stream reports that its history has been truncated,
    /// restart the subscription from "now" instead of failing it.
    pub restart_on_change_stream_history_lost: bool,

    /// Retry strategy wrapped around event delivery and position persistence
    pub retry: RetryStrategy,
}

impl Default for SubscriptionModelConfig {
    fn default() -> Self {
        Self {
            restart_on_change_stream_history_lost: false,
            retry: RetryStrategy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
                2.0,
            ),
        }
    }
}

/// Configuration for the lease-based competing-consumer strategy
#[derive(Debug, Clone)]
pub struct CompetingConsumerConfig {
    /// Collection holding one lease document per subscription id
    pub lease_collection: String,

    /// How long an acquired lease is valid without renewal. The heartbeat
    /// renews at a third of this interval.
    pub lease_ttl: Duration,
}

impl Default for CompetingConsumerConfig {
    fn default() -> Self {
        Self {
            lease_collection: "competing-consumer-locks".to_string(),
            lease_ttl: Duration::from_secs(20),
        }
    }
}
