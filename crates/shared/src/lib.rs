// Shared crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storesync Shared Module
//!
//! Configuration, persisted entities, and the interface seams to the
//! external collaborators the ingestion pipeline depends on:
//!
//! - **Persistent store**: point get/put plus an indexed query over the
//!   `subscriptions` and `user-subscriptions` tables
//! - **Historical queue**: at-least-once JSON message delivery
//! - **Identity service**: external account token exchange
//!
//! Postgres-backed implementations live in [`pg`]; in-memory
//! implementations (used as test doubles and for local runs) live in
//! [`memory`].

pub mod config;
pub mod entities;
pub mod identity;
pub mod memory;
pub mod pg;
pub mod queue;
pub mod store;

pub use config::{ConfigError, IngestConfig, Stage};
pub use entities::{Subscription, UserSubscriptionLink, SUBSCRIPTION_TTL_DAYS};
pub use identity::{IdentityError, IdentityService};
pub use memory::{MemoryEventQueue, MemoryIdentityService, MemoryLinkStore, MemorySubscriptionStore};
pub use pg::{PgLinkStore, PgSubscriptionStore};
pub use queue::{EventQueue, QueueError};
pub use store::{StoreError, SubscriptionStore, UserLinkStore};
