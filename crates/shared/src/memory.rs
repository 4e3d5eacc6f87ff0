//! In-memory collaborator implementations
//!
//! Used as test doubles and for local runs without external services. The
//! queue and store variants can be switched into a failing mode to exercise
//! the reconciler's partial-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::entities::{Subscription, UserSubscriptionLink};
use crate::identity::{IdentityError, IdentityService};
use crate::queue::{EventQueue, QueueError};
use crate::store::{StoreError, SubscriptionStore, UserLinkStore};

#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: RwLock<HashMap<String, Subscription>>,
    fail: AtomicBool,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as unavailable.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, subscription_id: &str) -> Result<Option<Subscription>, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(self.rows.read().await.get(subscription_id).cloned())
    }

    async fn put(&self, subscription: &Subscription) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.rows
            .write()
            .await
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLinkStore {
    rows: RwLock<Vec<UserSubscriptionLink>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl UserLinkStore for MemoryLinkStore {
    async fn put(&self, link: &UserSubscriptionLink) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        // Insert-once semantics, matching the Postgres ON CONFLICT DO NOTHING
        if !rows
            .iter()
            .any(|l| l.user_id == link.user_id && l.subscription_id == link.subscription_id)
        {
            rows.push(link.clone());
        }
        Ok(())
    }

    async fn query_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<UserSubscriptionLink>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|l| l.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryEventQueue {
    messages: RwLock<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl MemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<(String, String)> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn send(&self, queue_url: &str, json_body: &str) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::SendFailed("injected failure".to_string()));
        }
        self.messages
            .write()
            .await
            .push((queue_url.to_string(), json_body.to_string()));
        Ok(())
    }
}

/// Maps known external tokens to identity ids; unknown tokens fail the
/// exchange like the real collaborator.
#[derive(Default)]
pub struct MemoryIdentityService {
    identities: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, external_token: &str, identity_id: &str) {
        self.identities
            .write()
            .await
            .insert(external_token.to_string(), identity_id.to_string());
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn exchange_token(&self, external_token: &str) -> Result<String, IdentityError> {
        self.identities
            .read()
            .await
            .get(external_token)
            .cloned()
            .ok_or(IdentityError::UnknownToken)
    }
}
