//! Persisted entities
//!
//! `Subscription` is the authoritative row owned by the persistent store,
//! keyed by the platform-specific subscription id and always written as a
//! full overwrite. `UserSubscriptionLink` joins an internal identity to a
//! subscription; it is created once and never updated.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Store-side expiry horizon for subscription rows (~30 months). Consumed
/// by the store's own TTL mechanism, not by application logic.
pub const SUBSCRIPTION_TTL_DAYS: i64 = 913;

/// Canonical persisted subscription record.
///
/// Created or overwritten in full on every successful reconciliation of the
/// same subscription id; redelivery of a record is therefore safe without
/// locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Platform-specific key: original transaction id (storefront A) or
    /// purchase token (storefront B).
    pub subscription_id: String,
    /// `app_store` or `play_store`.
    pub platform: String,
    pub product_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub auto_renewing: bool,
    /// Opaque storefront payload kept for audit; never interpreted after
    /// normalization.
    pub payload: serde_json::Value,
    /// Epoch seconds; row expiry handled by the store itself.
    pub ttl: i64,
}

impl Subscription {
    /// TTL value for a row written now.
    pub fn ttl_from_now() -> i64 {
        (OffsetDateTime::now_utc() + Duration::days(SUBSCRIPTION_TTL_DAYS)).unix_timestamp()
    }
}

/// Join row from an internal identity to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSubscriptionLink {
    pub user_id: String,
    pub subscription_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UserSubscriptionLink {
    pub fn new(user_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            subscription_id: subscription_id.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
