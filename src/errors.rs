//! Error types for event store and subscription operations

use thiserror::Error;

use crate::condition::WriteCondition;

/// Errors that can occur when writing to or reading from the event store
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The write condition did not hold against the current stream version
    #[error("WriteCondition was not fulfilled. Expected version {condition} but was {actual}.")]
    WriteConditionNotFulfilled {
        /// The condition that was evaluated
        condition: WriteCondition,
        /// The stream version the condition was evaluated against
        actual: u64,
    },

    /// An event with the same `(id, source)` already exists
    #[error("duplicate CloudEvent: an event with the same id and source is already persisted")]
    DuplicateCloudEvent(#[source] mongodb::error::Error),

    /// A version condition was supplied but the consistency guarantee is `None`
    #[error("write condition \"{0}\" is not supported when the stream consistency guarantee is None")]
    WriteConditionNotSupported(WriteCondition),

    /// Underlying MongoDB error
    #[error("MongoDB error: {0}")]
    Storage(#[from] mongodb::error::Error),

    /// A persisted event document could not be mapped back to a CloudEvent
    #[error("invalid event document: {0}")]
    InvalidDocument(String),

    /// A CloudEvent could not be mapped to a BSON document
    #[error("serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),
}

/// Result type for event store operations
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Errors that can occur in the subscription model
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// A subscription with this id is already registered on this model
    #[error("subscription {0} is already registered")]
    SubscriptionAlreadyExists(String),

    /// The subscription is unknown to this model, or not in the required state
    #[error("subscription {0} is not running")]
    SubscriptionNotRunning(String),

    /// The model has been shut down and no longer accepts operations
    #[error("subscription model has been shut down")]
    ModelShutDown,

    /// The change stream lost history and restarting from "now" is disabled
    #[error("change stream history lost for subscription {0}; cannot catch up")]
    CatchupImpossible(String),

    /// Underlying MongoDB error
    #[error("MongoDB error: {0}")]
    Storage(#[from] mongodb::error::Error),

    /// The event handler returned an error and retries were exhausted
    #[error("event handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// A change stream document could not be mapped back to a CloudEvent
    #[error("invalid event document: {0}")]
    InvalidDocument(String),

    /// A subscription position could not be serialized or deserialized
    #[error("invalid subscription position: {0}")]
    InvalidPosition(String),
}

/// Result type for subscription operations
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;

    #[test]
    fn write_condition_not_fulfilled_message() {
        let err = EventStoreError::WriteConditionNotFulfilled {
            condition: WriteCondition::stream_version_eq(10),
            actual: 1,
        };

        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be equal to 10 but was 1."
        );
    }

    #[test]
    fn write_condition_not_fulfilled_message_for_composite_condition() {
        let err = EventStoreError::WriteConditionNotFulfilled {
            condition: WriteCondition::stream_version(Condition::and(vec![
                Condition::Gte(0),
                Condition::Lt(100),
                Condition::Ne(1),
            ])),
            actual: 1,
        };

        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be greater than or equal to 0 \
             and to be less than 100 and to not be equal to 1 but was 1."
        );
    }

    #[test]
    fn model_shut_down_message() {
        assert_eq!(
            SubscriptionError::ModelShutDown.to_string(),
            "subscription model has been shut down"
        );
    }
}
