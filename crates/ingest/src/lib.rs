// Ingest crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storesync Ingestion Module
//!
//! Validates, normalizes, and reconciles subscription lifecycle events
//! from two external storefronts.
//!
//! ## Pipeline
//!
//! - **Error taxonomy**: every failure is Retryable, GracefulSkip, or
//!   Fatal; callers branch on the kind, never on raw status codes
//! - **Receipt validation**: polled storefront A receipt validation with a
//!   single same-environment-first/sandbox-fallback call
//! - **Normalization**: untyped validation responses become de-duplicated,
//!   expiry-sorted canonical receipt entries
//! - **Notifications**: pushed storefront B envelopes decode to a
//!   subscription change, an ignorable event, or a fatal parse error
//! - **Reconciliation**: fetch → persist (full overwrite) → historical
//!   queue forward → best-effort identity link, batch-concurrent with
//!   per-record retry isolation

pub mod error;
pub mod metrics;
pub mod notifications;
pub mod receipt;
pub mod reconcile;
pub mod validation;


// Error
pub use error::{Environment, ErrorKind, IngestError, IngestResult};

// Metrics
pub use metrics::{CounterSnapshot, IngestCounters};

// Notifications
pub use notifications::{
    event_label, parse, ParsedNotification, PlaySubscriptionClient, PlaySubscriptionDetail,
    PushEnvelope, SubscriptionChange, SubscriptionChangeNotification,
};

// Receipt normalization
pub use receipt::{
    normalize, CanonicalReceiptInfo, OneOrMany, RawValidationResponse, MAX_RECEIPT_ENTRIES,
};

// Reconciliation
pub use reconcile::{
    BatchSummary, ReconcileOutcome, SubscriptionReference, UpdateReconciler, PLATFORM_APP_STORE,
    PLATFORM_PLAY_STORE,
};

// Validation
pub use validation::{ReceiptValidationClient, ValidateOptions};

use std::sync::Arc;

use storesync_shared::{
    ConfigError, EventQueue, IdentityService, IngestConfig, SubscriptionStore, UserLinkStore,
};

/// Main ingestion service combining the storefront clients and the
/// reconciler behind one construction point.
pub struct IngestService {
    pub validation: ReceiptValidationClient,
    pub play: PlaySubscriptionClient,
    pub reconciler: UpdateReconciler,
}

impl IngestService {
    /// Create the service with explicit config and collaborators.
    pub fn new(
        config: IngestConfig,
        store: Arc<dyn SubscriptionStore>,
        links: Arc<dyn UserLinkStore>,
        queue: Arc<dyn EventQueue>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        let validation = ReceiptValidationClient::new(config.clone());
        let play = PlaySubscriptionClient::new(config.clone());
        // One client pair serves both the service surface and the
        // reconciler; each clone shares the underlying connection pool.
        let reconciler = UpdateReconciler::new(
            config,
            validation.clone(),
            play.clone(),
            store,
            links,
            queue,
            identity,
        );
        Self {
            validation,
            play,
            reconciler,
        }
    }

    /// Create the service from environment variables.
    pub fn from_env(
        store: Arc<dyn SubscriptionStore>,
        links: Arc<dyn UserLinkStore>,
        queue: Arc<dyn EventQueue>,
        identity: Arc<dyn IdentityService>,
    ) -> Result<Self, ConfigError> {
        let config = IngestConfig::from_env()?;
        Ok(Self::new(config, store, links, queue, identity))
    }
}
