//! Update reconciliation workflow
//!
//! Per inbound reference record: decode → fetch canonical subscription
//! state from the owning storefront → persist (full overwrite) → forward a
//! redacted event to the historical queue → best-effort identity link.
//! GracefulSkip and Fatal outcomes are absorbed here and reported as
//! success to the transport; only Retryable failures propagate so the
//! record gets redelivered.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use storesync_shared::{
    EventQueue, IdentityService, IngestConfig, Subscription, SubscriptionStore,
    UserLinkStore, UserSubscriptionLink,
};

use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::metrics::IngestCounters;
use crate::notifications::{self, event_label, ParsedNotification, PlaySubscriptionClient};
use crate::receipt::CanonicalReceiptInfo;
use crate::validation::{ReceiptValidationClient, ValidateOptions};

pub const PLATFORM_APP_STORE: &str = "app_store";
pub const PLATFORM_PLAY_STORE: &str = "play_store";

/// Minimal payload needed to re-fetch full subscription detail from a
/// storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum SubscriptionReference {
    AppStore {
        receipt: String,
        /// Account token the app attached when it registered the receipt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_account_token: Option<String>,
    },
    PlayStore {
        package_name: String,
        subscription_id: String,
        purchase_token: String,
    },
}

impl SubscriptionReference {
    pub fn from_json(body: &str) -> IngestResult<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Per-record result; everything but a propagated Retryable error is
/// success at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Subscription fetched and persisted.
    Reconciled,
    /// Valid but not actionable (wrong environment); no side effects.
    Skipped,
    /// Invalid record dropped; counted, no side effects.
    Dropped,
    /// Recognized-but-irrelevant notification; no side effects.
    Ignored,
}

/// Aggregated outcome of one inbound batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub reconciled: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub ignored: usize,
    /// Indices of records that must be redelivered by the transport.
    pub retryable_indices: Vec<usize>,
}

impl BatchSummary {
    pub fn requires_redelivery(&self) -> bool {
        !self.retryable_indices.is_empty()
    }
}

/// Redacted projection forwarded to the historical queue. Carries derived
/// fields only; the receipt blob and raw storefront payload never leave
/// the pipeline this way.
#[derive(Debug, Serialize)]
struct HistoricalEvent<'a> {
    event_id: Uuid,
    subscription_id: &'a str,
    platform: &'a str,
    product_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_label: Option<&'a str>,
    #[serde(with = "time::serde::rfc3339")]
    start_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    end_at: OffsetDateTime,
    auto_renewing: bool,
    cancelled: bool,
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: OffsetDateTime,
}

fn millis_to_timestamp(ms: i64) -> IngestResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|_| IngestError::Malformed(format!("timestamp out of range: {ms}")))
}

pub struct UpdateReconciler {
    validation: ReceiptValidationClient,
    play: PlaySubscriptionClient,
    store: Arc<dyn SubscriptionStore>,
    links: Arc<dyn UserLinkStore>,
    queue: Arc<dyn EventQueue>,
    identity: Arc<dyn IdentityService>,
    config: IngestConfig,
    counters: Arc<IngestCounters>,
}

impl UpdateReconciler {
    pub fn new(
        config: IngestConfig,
        validation: ReceiptValidationClient,
        play: PlaySubscriptionClient,
        store: Arc<dyn SubscriptionStore>,
        links: Arc<dyn UserLinkStore>,
        queue: Arc<dyn EventQueue>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self {
            validation,
            play,
            store,
            links,
            queue,
            identity,
            config,
            counters: Arc::new(IngestCounters::new()),
        }
    }

    pub fn counters(&self) -> Arc<IngestCounters> {
        Arc::clone(&self.counters)
    }

    /// Reconcile one decoded reference. GracefulSkip and Fatal are absorbed
    /// (returned as `Skipped`/`Dropped`); Retryable propagates.
    pub async fn reconcile(
        &self,
        reference: &SubscriptionReference,
    ) -> IngestResult<ReconcileOutcome> {
        self.reconcile_labeled(reference, None).await
    }

    /// Decode a raw JSON reference and reconcile it. Decode failures are
    /// Fatal and propagate; the batch layer decides record isolation.
    pub async fn reconcile_json(&self, body: &str) -> IngestResult<ReconcileOutcome> {
        let reference = SubscriptionReference::from_json(body)?;
        self.reconcile(&reference).await
    }

    /// Parse an inbound push envelope and reconcile the change it carries.
    /// Ignorable notifications succeed with zero side effects; parse
    /// failures are absorbed as dropped records.
    pub async fn handle_notification(&self, envelope_body: &str) -> IngestResult<ReconcileOutcome> {
        let parsed = match notifications::parse(envelope_body) {
            Ok(parsed) => parsed,
            Err(e) => return self.absorb(e),
        };

        match parsed {
            ParsedNotification::Ignorable(reason) => {
                tracing::info!(reason = reason, "Ignorable notification, nothing to do");
                Ok(ReconcileOutcome::Ignored)
            }
            ParsedNotification::SubscriptionChange(change) => {
                let label = event_label(change.notification.notification_type);
                let reference = SubscriptionReference::PlayStore {
                    package_name: change.package_name,
                    subscription_id: change.notification.subscription_id,
                    purchase_token: change.notification.purchase_token,
                };
                self.reconcile_labeled(&reference, Some(label.as_str())).await
            }
        }
    }

    /// Process a batch of raw JSON references independently and
    /// concurrently. One record's Fatal/GracefulSkip outcome never blocks
    /// or fails its siblings; Retryable records are reported by index for
    /// per-record redelivery.
    pub async fn reconcile_batch(&self, records: &[String]) -> BatchSummary {
        let outcomes = join_all(
            records
                .iter()
                .enumerate()
                .map(|(index, body)| async move { (index, self.reconcile_json(body).await) }),
        )
        .await;

        let mut summary = BatchSummary::default();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(ReconcileOutcome::Reconciled) => summary.reconciled += 1,
                Ok(ReconcileOutcome::Skipped) => summary.skipped += 1,
                Ok(ReconcileOutcome::Dropped) => summary.dropped += 1,
                Ok(ReconcileOutcome::Ignored) => summary.ignored += 1,
                // The per-record paths already counted the retryable
                // failure; the batch loop only flags the index.
                Err(e) if e.kind() == ErrorKind::Retryable => {
                    tracing::warn!(
                        record_index = index,
                        error = %e,
                        "Record failed with a transient error, flagging for redelivery"
                    );
                    summary.retryable_indices.push(index);
                }
                Err(e) => {
                    // Propagated decode failures land here; absorbed at the
                    // batch boundary like any other fatal record.
                    self.counters.record_dropped();
                    tracing::error!(
                        record_index = index,
                        error = %e,
                        "Dropping undecodable record"
                    );
                    summary.dropped += 1;
                }
            }
        }

        tracing::info!(
            total = records.len(),
            reconciled = summary.reconciled,
            skipped = summary.skipped,
            dropped = summary.dropped,
            ignored = summary.ignored,
            retryable = summary.retryable_indices.len(),
            "Batch reconciliation complete"
        );

        summary
    }

    async fn reconcile_labeled(
        &self,
        reference: &SubscriptionReference,
        label: Option<&str>,
    ) -> IngestResult<ReconcileOutcome> {
        let (subscription, external_token) = match self.fetch_canonical(reference).await {
            Ok(fetched) => fetched,
            Err(e) => return self.absorb(e),
        };

        // Persistence and the historical forward are independent; the
        // identity link waits for persistence below.
        let persist = self.store.put(&subscription);
        let forward = self.forward_event(&subscription, label);
        let (persisted, _) = tokio::join!(persist, forward);

        if let Err(e) = persisted {
            self.counters.record_retryable();
            return Err(IngestError::from(e));
        }

        self.link_identity(external_token.as_deref(), &subscription.subscription_id)
            .await;

        self.counters.record_reconciled();
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            platform = %subscription.platform,
            auto_renewing = subscription.auto_renewing,
            "Subscription reconciled"
        );
        Ok(ReconcileOutcome::Reconciled)
    }

    fn absorb(&self, error: IngestError) -> IngestResult<ReconcileOutcome> {
        match error.kind() {
            ErrorKind::GracefulSkip => {
                self.counters.record_skipped();
                tracing::info!(reason = %error, "Record not actionable here, skipping gracefully");
                Ok(ReconcileOutcome::Skipped)
            }
            ErrorKind::Fatal => {
                self.counters.record_dropped();
                tracing::error!(error = %error, "Dropping invalid record");
                Ok(ReconcileOutcome::Dropped)
            }
            ErrorKind::Retryable => {
                self.counters.record_retryable();
                Err(error)
            }
        }
    }

    /// Fetch canonical subscription state from the storefront that owns the
    /// reference and build the entity to persist. Returns the external
    /// account token, if the storefront payload carried one.
    async fn fetch_canonical(
        &self,
        reference: &SubscriptionReference,
    ) -> IngestResult<(Subscription, Option<String>)> {
        match reference {
            SubscriptionReference::AppStore {
                receipt,
                external_account_token,
            } => {
                let canonical = self
                    .validation
                    .validate(receipt, ValidateOptions { allow_sandbox_retry: true })
                    .await?;
                // Ascending expiry order; the last entry is the lineage's
                // current state.
                let latest = canonical.last().ok_or(IngestError::MissingReceiptInfo)?;
                let subscription = self.subscription_from_receipt(latest)?;
                Ok((subscription, external_account_token.clone()))
            }
            SubscriptionReference::PlayStore {
                package_name,
                subscription_id,
                purchase_token,
            } => {
                let (detail, raw) = self
                    .play
                    .fetch_detail(package_name, subscription_id, purchase_token)
                    .await?;

                let start_ms = detail.start_time_millis.ok_or_else(|| {
                    IngestError::Malformed("subscription detail missing startTimeMillis".to_string())
                })?;
                let end_ms = detail.expiry_time_millis.ok_or_else(|| {
                    IngestError::Malformed("subscription detail missing expiryTimeMillis".to_string())
                })?;

                let subscription = Subscription {
                    subscription_id: purchase_token.clone(),
                    platform: PLATFORM_PLAY_STORE.to_string(),
                    product_id: subscription_id.clone(),
                    start_at: millis_to_timestamp(start_ms)?,
                    end_at: millis_to_timestamp(end_ms)?,
                    cancelled_at: detail
                        .user_cancellation_time_millis
                        .map(millis_to_timestamp)
                        .transpose()?,
                    auto_renewing: detail.auto_renewing,
                    payload: raw,
                    ttl: Subscription::ttl_from_now(),
                };
                Ok((subscription, detail.obfuscated_external_account_id))
            }
        }
    }

    fn subscription_from_receipt(
        &self,
        canonical: &CanonicalReceiptInfo,
    ) -> IngestResult<Subscription> {
        Ok(Subscription {
            subscription_id: canonical.original_transaction_id.clone(),
            platform: PLATFORM_APP_STORE.to_string(),
            product_id: canonical.product_id.clone(),
            start_at: millis_to_timestamp(canonical.original_purchase_at)?,
            end_at: millis_to_timestamp(canonical.expires_at)?,
            cancelled_at: canonical.cancelled_at.map(millis_to_timestamp).transpose()?,
            auto_renewing: canonical.auto_renew_status,
            payload: serde_json::to_value(canonical)?,
            ttl: Subscription::ttl_from_now(),
        })
    }

    /// Best-effort forward of the redacted projection; a queue failure is
    /// logged and never fails the reconciliation.
    async fn forward_event(&self, subscription: &Subscription, label: Option<&str>) {
        let event = HistoricalEvent {
            event_id: Uuid::new_v4(),
            subscription_id: &subscription.subscription_id,
            platform: &subscription.platform,
            product_id: &subscription.product_id,
            event_label: label,
            start_at: subscription.start_at,
            end_at: subscription.end_at,
            auto_renewing: subscription.auto_renewing,
            cancelled: subscription.cancelled_at.is_some(),
            recorded_at: OffsetDateTime::now_utc(),
        };

        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize historical event");
                return;
            }
        };

        if let Err(e) = self.queue.send(&self.config.history_queue_url, &body).await {
            tracing::warn!(
                subscription_id = %subscription.subscription_id,
                error = %e,
                "Failed to forward historical event"
            );
        }
    }

    /// Exchange the external account token for an identity and persist the
    /// link. Absence of a token and exchange failures are logged, never
    /// errors.
    async fn link_identity(&self, external_token: Option<&str>, subscription_id: &str) {
        let token = match external_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    "No external account token on payload, skipping identity link"
                );
                return;
            }
        };

        let identity_id = match self.identity.exchange_token(token).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Identity token exchange failed, continuing without link"
                );
                return;
            }
        };

        let link = UserSubscriptionLink::new(identity_id.clone(), subscription_id);
        if let Err(e) = self.links.put(&link).await {
            tracing::warn!(
                subscription_id = %subscription_id,
                identity_id = %identity_id,
                error = %e,
                "Failed to persist user subscription link"
            );
            return;
        }

        tracing::info!(
            subscription_id = %subscription_id,
            identity_id = %identity_id,
            "Linked subscription to identity"
        );
    }
}
