//! Push notification parsing (storefront B)
//!
//! Storefront B pushes notifications instead of being polled: an outer
//! envelope wraps a base64-encoded developer notification, which is either
//! a subscription change, a voided purchase, or a test ping. Only
//! subscription changes are actionable; the rest parse to
//! [`ParsedNotification::Ignorable`], a value the caller short-circuits on
//! without side effects.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use time::OffsetDateTime;

use storesync_shared::IngestConfig;

use crate::error::{IngestError, IngestResult};

/// Millisecond timestamps arrive as strings or numbers.
fn loose_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }))
}

/// Outer push envelope; the shape is fixed by the push transport.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded developer notification JSON.
    pub data: String,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
}

/// Union of the known inner notification shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeveloperNotification {
    #[serde(default)]
    package_name: Option<String>,
    #[serde(default, deserialize_with = "loose_millis")]
    event_time_millis: Option<i64>,
    #[serde(default)]
    subscription_notification: Option<SubscriptionChangeNotification>,
    #[serde(default)]
    voided_purchase_notification: Option<Value>,
    #[serde(default)]
    test_notification: Option<Value>,
}

/// An actionable subscription lifecycle change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionChangeNotification {
    pub notification_type: i64,
    pub purchase_token: String,
    pub subscription_id: String,
}

/// A parsed, validated subscription change with its envelope context.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChange {
    pub package_name: String,
    /// Milliseconds since epoch; validated to be a real timestamp.
    pub event_time: i64,
    pub notification: SubscriptionChangeNotification,
}

/// Result of parsing an envelope body. `Ignorable` is a distinguished
/// non-error: recognized but not actionable, and must not fail the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedNotification {
    SubscriptionChange(SubscriptionChange),
    Ignorable(&'static str),
}

/// Decode, schema-validate, and classify an inbound push envelope.
pub fn parse(envelope_body: &str) -> IngestResult<ParsedNotification> {
    let envelope: PushEnvelope = serde_json::from_str(envelope_body)?;

    let decoded = BASE64
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| IngestError::Malformed(format!("invalid base64 in message data: {e}")))?;
    let inner = String::from_utf8(decoded)
        .map_err(|e| IngestError::Malformed(format!("message data is not utf-8: {e}")))?;

    let notification: DeveloperNotification = serde_json::from_str(&inner)?;

    // A structurally valid but semantically unparseable event time is a
    // parse failure, never silently defaulted.
    let event_time = notification
        .event_time_millis
        .filter(|ms| OffsetDateTime::from_unix_timestamp(ms / 1000).is_ok())
        .ok_or_else(|| {
            IngestError::Malformed("notification eventTimeMillis is not a valid timestamp".to_string())
        })?;

    if let Some(change) = notification.subscription_notification {
        let package_name = notification
            .package_name
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                IngestError::Malformed("subscription notification missing packageName".to_string())
            })?;

        tracing::debug!(
            package_name = %package_name,
            notification_type = change.notification_type,
            event_label = %event_label(change.notification_type),
            "Parsed subscription change notification"
        );

        return Ok(ParsedNotification::SubscriptionChange(SubscriptionChange {
            package_name,
            event_time,
            notification: change,
        }));
    }

    if notification.voided_purchase_notification.is_some() {
        return Ok(ParsedNotification::Ignorable("voided_purchase"));
    }

    if notification.test_notification.is_some() {
        return Ok(ParsedNotification::Ignorable("test_notification"));
    }

    Err(IngestError::Malformed(
        "notification matches no known shape".to_string(),
    ))
}

/// Semantic label for a numeric notification type. Unknown codes fall back
/// to their string form; the event still gets logged under that label.
pub fn event_label(notification_type: i64) -> String {
    match notification_type {
        1 => "RECOVERED".to_string(),
        2 => "RENEWED".to_string(),
        3 => "CANCELED".to_string(),
        4 => "PURCHASED".to_string(),
        5 => "ON_HOLD".to_string(),
        6 => "IN_GRACE_PERIOD".to_string(),
        7 => "RESTARTED".to_string(),
        8 => "PRICE_CHANGE_CONFIRMED".to_string(),
        9 => "DEFERRED".to_string(),
        10 => "PAUSED".to_string(),
        11 => "PAUSE_SCHEDULE_CHANGED".to_string(),
        12 => "REVOKED".to_string(),
        13 => "EXPIRED".to_string(),
        other => other.to_string(),
    }
}

/// Point-lookup detail for one storefront-B subscription purchase.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaySubscriptionDetail {
    #[serde(default, deserialize_with = "loose_millis")]
    pub start_time_millis: Option<i64>,
    #[serde(default, deserialize_with = "loose_millis")]
    pub expiry_time_millis: Option<i64>,
    #[serde(default, deserialize_with = "loose_millis")]
    pub user_cancellation_time_millis: Option<i64>,
    #[serde(default)]
    pub auto_renewing: bool,
    #[serde(default)]
    pub payment_state: Option<i64>,
    /// External account token, exchangeable for an internal identity.
    #[serde(default)]
    pub obfuscated_external_account_id: Option<String>,
    #[serde(default)]
    pub linked_purchase_token: Option<String>,
}

/// Client for storefront B's subscription-detail endpoint; the polled
/// counterpart to the receipt validation client.
#[derive(Clone)]
pub struct PlaySubscriptionClient {
    http: reqwest::Client,
    config: IngestConfig,
}

impl PlaySubscriptionClient {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Fetch canonical subscription detail for one purchase token.
    ///
    /// 404/410 mean the storefront no longer knows the purchase; that will
    /// not self-correct, so it classifies Fatal. Everything else non-2xx is
    /// transient.
    pub async fn fetch_detail(
        &self,
        package_name: &str,
        subscription_id: &str,
        purchase_token: &str,
    ) -> IngestResult<(PlaySubscriptionDetail, Value)> {
        let url = format!(
            "{}/{package_name}/purchases/subscriptions/{subscription_id}/tokens/{purchase_token}",
            self.config.play_api_url
        );

        let response = self.http.get(&url).send().await?;
        let http_status = response.status();

        if http_status == reqwest::StatusCode::NOT_FOUND
            || http_status == reqwest::StatusCode::GONE
        {
            tracing::error!(
                subscription_id = %subscription_id,
                http_status = %http_status,
                "Purchase token no longer known to storefront"
            );
            return Err(IngestError::PurchaseGone(http_status.as_u16()));
        }
        if !http_status.is_success() {
            tracing::warn!(
                subscription_id = %subscription_id,
                http_status = %http_status,
                "Subscription detail endpoint returned non-2xx HTTP status"
            );
            return Err(IngestError::UpstreamHttp(http_status.as_u16()));
        }

        let raw: Value = serde_json::from_str(&response.text().await?)?;
        let detail: PlaySubscriptionDetail = serde_json::from_value(raw.clone())?;
        Ok((detail, raw))
    }
}
