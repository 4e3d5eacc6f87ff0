//! Postgres-backed store implementations
//!
//! Subscription writes are full-record upserts keyed by subscription id, so
//! redelivery of the same inbound record is idempotent without locking.
//! User links are insert-once; a conflicting insert is a no-op.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::entities::{Subscription, UserSubscriptionLink};
use crate::store::{StoreError, SubscriptionStore, UserLinkStore};

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, subscription_id: &str) -> Result<Option<Subscription>, StoreError> {
        let row: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT subscription_id, platform, product_id, start_at, end_at,
                   cancelled_at, auto_renewing, payload, ttl
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn put(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, platform, product_id, start_at, end_at,
                cancelled_at, auto_renewing, payload, ttl, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (subscription_id) DO UPDATE SET
                platform = EXCLUDED.platform,
                product_id = EXCLUDED.product_id,
                start_at = EXCLUDED.start_at,
                end_at = EXCLUDED.end_at,
                cancelled_at = EXCLUDED.cancelled_at,
                auto_renewing = EXCLUDED.auto_renewing,
                payload = EXCLUDED.payload,
                ttl = EXCLUDED.ttl,
                updated_at = NOW()
            "#,
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.platform)
        .bind(&subscription.product_id)
        .bind(subscription.start_at)
        .bind(subscription.end_at)
        .bind(subscription.cancelled_at)
        .bind(subscription.auto_renewing)
        .bind(&subscription.payload)
        .bind(subscription.ttl)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            subscription_id = %subscription.subscription_id,
            platform = %subscription.platform,
            "Stored subscription (full overwrite)"
        );

        Ok(())
    }
}

#[derive(Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserLinkStore for PgLinkStore {
    async fn put(&self, link: &UserSubscriptionLink) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (user_id, subscription_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, subscription_id) DO NOTHING
            "#,
        )
        .bind(&link.user_id)
        .bind(&link.subscription_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<UserSubscriptionLink>, StoreError> {
        let rows: Vec<UserSubscriptionLink> = sqlx::query_as(
            r#"
            SELECT user_id, subscription_id, created_at
            FROM user_subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
