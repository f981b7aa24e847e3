//! Persistent storage of subscription positions
//!
//! One document per subscription id, holding either the change stream's
//! resume token or an operation time:
//!
//! ```text
//! { _id: <subscriptionId>, resumeToken: <opaque> }
//! { _id: <subscriptionId>, operationTime: Timestamp }
//! ```

use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::ResumeToken;
use mongodb::{Collection, Database};
use tracing::debug;

use crate::errors::{SubscriptionError, SubscriptionResult};
use crate::subscription::SubscriptionPosition;

const RESUME_TOKEN: &str = "resumeToken";
const OPERATION_TIME: &str = "operationTime";

/// MongoDB-backed storage of subscription positions
#[derive(Clone)]
pub struct MongoSubscriptionPositionStorage {
    positions: Collection<Document>,
}

impl MongoSubscriptionPositionStorage {
    /// Create a position storage over the given collection.
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            positions: db.collection::<Document>(collection),
        }
    }

    /// Persist the position for a subscription, replacing any previous one.
    pub async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
    ) -> SubscriptionResult<()> {
        let mut document = doc! { "_id": subscription_id };

        match position {
            SubscriptionPosition::ResumeToken(token) => {
                let token = mongodb::bson::to_bson(token)
                    .map_err(|e| SubscriptionError::InvalidPosition(e.to_string()))?;
                document.insert(RESUME_TOKEN, token);
            }
            SubscriptionPosition::OperationTime(time) => {
                document.insert(OPERATION_TIME, Bson::Timestamp(*time));
            }
        }

        self.positions
            .replace_one(doc! { "_id": subscription_id }, document)
            .upsert(true)
            .await?;

        debug!(subscription = subscription_id, "position persisted");
        Ok(())
    }

    /// Read the stored position for a subscription, if any.
    pub async fn read(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<Option<SubscriptionPosition>> {
        let Some(document) = self
            .positions
            .find_one(doc! { "_id": subscription_id })
            .await?
        else {
            return Ok(None);
        };

        if let Some(token) = document.get(RESUME_TOKEN) {
            let token: ResumeToken = mongodb::bson::from_bson(token.clone())
                .map_err(|e| SubscriptionError::InvalidPosition(e.to_string()))?;
            return Ok(Some(SubscriptionPosition::ResumeToken(token)));
        }

        if let Some(Bson::Timestamp(time)) = document.get(OPERATION_TIME) {
            return Ok(Some(SubscriptionPosition::OperationTime(*time)));
        }

        Err(SubscriptionError::InvalidPosition(format!(
            "subscription {subscription_id} has a malformed position document"
        )))
    }

    /// Delete the stored position for a subscription.
    pub async fn delete(&self, subscription_id: &str) -> SubscriptionResult<()> {
        self.positions
            .delete_one(doc! { "_id": subscription_id })
            .await?;

        Ok(())
    }
}
