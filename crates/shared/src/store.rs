//! Persistent store interface
//!
//! The store is an external collaborator; the pipeline only depends on
//! point get/put over `subscriptions` and put/indexed-query over
//! `user-subscriptions`. Implementations: [`crate::pg`], [`crate::memory`].

use async_trait::async_trait;
use thiserror::Error;

use crate::entities::{Subscription, UserSubscriptionLink};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Point operations over the `subscriptions` table.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, subscription_id: &str) -> Result<Option<Subscription>, StoreError>;

    /// Full-record overwrite keyed by subscription id.
    async fn put(&self, subscription: &Subscription) -> Result<(), StoreError>;
}

/// Operations over the `user-subscriptions` join table.
#[async_trait]
pub trait UserLinkStore: Send + Sync {
    async fn put(&self, link: &UserSubscriptionLink) -> Result<(), StoreError>;

    /// Lookup through the secondary index on subscription id.
    async fn query_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<UserSubscriptionLink>, StoreError>;
}
