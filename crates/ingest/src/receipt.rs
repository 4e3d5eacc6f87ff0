//! Receipt payload normalization
//!
//! The validation endpoint's response body is untyped and inconsistent
//! across storefront versions: scalar fields arrive as strings or numbers,
//! `latest_receipt_info` is a single object or an array, and the bundle id
//! can live in three different places. Everything ambiguous is resolved
//! here, at the serde boundary; nothing downstream sees a raw payload.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{IngestError, IngestResult};

/// Cap on canonical entries per response; protects downstream fan-out from
/// a pathological response size.
pub const MAX_RECEIPT_ENTRIES: usize = 20;

/// Object-or-array field, normalized to a list immediately on parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Accepts a string, number, or bool where a string is expected.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }))
}

/// Accepts a number or a numeric string where an integer is expected.
fn loose_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("non-integer status")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom("non-numeric status")),
        other => Err(serde::de::Error::custom(format!(
            "unexpected status type: {other}"
        ))),
    }
}

/// One entry of `latest_receipt_info` / `latest_expired_receipt_info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReceiptEntry {
    #[serde(default, deserialize_with = "loose_string")]
    pub original_transaction_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub product_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub bundle_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub expires_date: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub expires_date_ms: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub original_purchase_date: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub original_purchase_date_ms: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub cancellation_date_ms: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub is_trial_period: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub is_in_intro_offer_period: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPendingRenewal {
    #[serde(default, deserialize_with = "loose_string")]
    pub original_transaction_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub auto_renew_status: Option<String>,
}

/// Top-level receipt object; only consulted for the bundle id fallback.
/// Older storefront versions used `bid` instead of `bundle_id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTopLevelReceipt {
    #[serde(default, deserialize_with = "loose_string")]
    pub bundle_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub bid: Option<String>,
}

/// The validated-but-messy response body. Ephemeral; discarded after
/// normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawValidationResponse {
    #[serde(deserialize_with = "loose_i64")]
    pub status: i64,
    #[serde(default, deserialize_with = "loose_string")]
    pub auto_renew_status: Option<String>,
    #[serde(default)]
    pub latest_receipt_info: Option<OneOrMany<RawReceiptEntry>>,
    #[serde(default)]
    pub latest_expired_receipt_info: Option<OneOrMany<RawReceiptEntry>>,
    #[serde(default)]
    pub pending_renewal_info: Vec<RawPendingRenewal>,
    #[serde(default)]
    pub receipt: Option<RawTopLevelReceipt>,
}

impl RawValidationResponse {
    pub fn has_receipt_info(&self) -> bool {
        self.latest_receipt_info.is_some() || self.latest_expired_receipt_info.is_some()
    }
}

/// One entry per distinct original transaction, fully resolved. All
/// timestamps are milliseconds since epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalReceiptInfo {
    pub original_transaction_id: String,
    pub product_id: String,
    pub bundle_id: Option<String>,
    pub expires_at: i64,
    pub original_purchase_at: i64,
    pub cancelled_at: Option<i64>,
    pub auto_renew_status: bool,
    pub trial_period: bool,
    pub intro_offer_period: bool,
}

fn parse_millis(ms_field: Option<&str>, plain_field: Option<&str>) -> Option<i64> {
    ms_field
        .or(plain_field)
        .and_then(|s| s.trim().parse::<i64>().ok())
}

fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value.map(str::trim) {
        Some("1") | Some("true") => Some(true),
        Some("0") | Some("false") => Some(false),
        _ => None,
    }
}

impl RawReceiptEntry {
    fn resolved_expiry(&self) -> Option<i64> {
        parse_millis(self.expires_date_ms.as_deref(), self.expires_date.as_deref())
    }
}

/// Normalize a raw validation response into a de-duplicated, ascending
/// expiry-sorted list of canonical receipt entries.
///
/// Rules:
/// - source is `latest_receipt_info` (object coerced to one-element list),
///   else `latest_expired_receipt_info`, else fatal
/// - entries without a resolvable expiry are not subscriptions and are
///   dropped
/// - one entry per `original_transaction_id`; latest expiry wins
/// - at most [`MAX_RECEIPT_ENTRIES`] survive, greatest expiries retained
pub fn normalize(raw: &RawValidationResponse) -> IngestResult<Vec<CanonicalReceiptInfo>> {
    let entries: Vec<RawReceiptEntry> = match (&raw.latest_receipt_info, &raw.latest_expired_receipt_info) {
        (Some(info), _) => info.clone().into_vec(),
        (None, Some(expired)) => expired.clone().into_vec(),
        (None, None) => return Err(IngestError::MissingReceiptInfo),
    };

    let total = entries.len();
    let mut dated: Vec<(i64, RawReceiptEntry)> = entries
        .into_iter()
        .filter_map(|entry| entry.resolved_expiry().map(|expiry| (expiry, entry)))
        .collect();

    if dated.len() < total {
        tracing::debug!(
            dropped = total - dated.len(),
            "Dropped receipt entries without an expiry (not subscriptions)"
        );
    }

    dated.sort_by_key(|(expiry, _)| *expiry);

    // Iterating in ascending expiry order and keeping the last write per id
    // makes the latest-expiry entry win the de-duplication.
    let mut by_id: HashMap<String, (i64, RawReceiptEntry)> = HashMap::new();
    for (expiry, entry) in dated {
        let id = entry
            .original_transaction_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                IngestError::Malformed("receipt entry missing original_transaction_id".to_string())
            })?;
        by_id.insert(id, (expiry, entry));
    }

    let mut deduped: Vec<(i64, RawReceiptEntry)> = by_id.into_values().collect();
    deduped.sort_by_key(|(expiry, _)| *expiry);

    if deduped.len() > MAX_RECEIPT_ENTRIES {
        let dropped = deduped.len() - MAX_RECEIPT_ENTRIES;
        deduped.drain(..dropped);
        tracing::warn!(
            dropped = dropped,
            kept = MAX_RECEIPT_ENTRIES,
            "Truncated oversized receipt response, oldest entries dropped"
        );
    }

    deduped
        .into_iter()
        .map(|(expiry, entry)| canonicalize(raw, expiry, entry))
        .collect()
}

fn canonicalize(
    raw: &RawValidationResponse,
    expires_at: i64,
    entry: RawReceiptEntry,
) -> IngestResult<CanonicalReceiptInfo> {
    // The de-duplication pass already rejected entries without an id.
    let original_transaction_id = entry.original_transaction_id.clone().ok_or_else(|| {
        IngestError::Malformed("receipt entry missing original_transaction_id".to_string())
    })?;

    let product_id = entry
        .product_id
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| IngestError::Malformed("receipt entry missing product_id".to_string()))?;

    // Malformed upstream data will not self-correct on redelivery, so a
    // non-parsing purchase date is fatal rather than retryable.
    let original_purchase_at = parse_millis(
        entry.original_purchase_date_ms.as_deref(),
        entry.original_purchase_date.as_deref(),
    )
    .ok_or_else(|| {
        IngestError::Malformed(format!(
            "unparseable original_purchase_date for transaction {original_transaction_id}"
        ))
    })?;

    let cancelled_at = parse_millis(entry.cancellation_date_ms.as_deref(), None);

    // Renewal intent lives in pending_renewal_info, joined by original
    // transaction id; the response-level flag is the fallback.
    let auto_renew_status = raw
        .pending_renewal_info
        .iter()
        .find(|renewal| {
            renewal.original_transaction_id.as_deref() == Some(original_transaction_id.as_str())
        })
        .and_then(|renewal| parse_flag(renewal.auto_renew_status.as_deref()))
        .or_else(|| parse_flag(raw.auto_renew_status.as_deref()))
        .unwrap_or(false);

    let bundle_id = entry
        .bundle_id
        .clone()
        .filter(|b| !b.is_empty())
        .or_else(|| {
            raw.receipt
                .as_ref()
                .and_then(|r| r.bundle_id.clone())
                .filter(|b| !b.is_empty())
        })
        .or_else(|| {
            raw.receipt
                .as_ref()
                .and_then(|r| r.bid.clone())
                .filter(|b| !b.is_empty())
        });

    if bundle_id.is_none() {
        tracing::warn!(
            original_transaction_id = %original_transaction_id,
            "No bundle id found in any payload location"
        );
    }

    Ok(CanonicalReceiptInfo {
        original_transaction_id,
        product_id,
        bundle_id,
        expires_at,
        original_purchase_at,
        cancelled_at,
        auto_renew_status,
        trial_period: parse_flag(entry.is_trial_period.as_deref()).unwrap_or(false),
        intro_offer_period: parse_flag(entry.is_in_intro_offer_period.as_deref()).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_raw(value: serde_json::Value) -> RawValidationResponse {
        serde_json::from_value(value).unwrap()
    }

    fn entry(id: &str, expires_ms: i64) -> serde_json::Value {
        json!({
            "original_transaction_id": id,
            "product_id": "com.example.monthly",
            "expires_date_ms": expires_ms.to_string(),
            "original_purchase_date_ms": "1567081703000",
        })
    }

    #[test]
    fn single_active_receipt_normalizes() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "expires_date_ms": "1570705794000",
                "original_purchase_date_ms": "1567081703000",
            }
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].original_transaction_id, "1234");
        assert_eq!(canonical[0].product_id, "P");
        assert_eq!(canonical[0].expires_at, 1570705794000);
        assert_eq!(canonical[0].original_purchase_at, 1567081703000);
    }

    #[test]
    fn duplicate_ids_keep_latest_expiry() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": [entry("1235", 100), entry("1235", 200)],
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].expires_at, 200);
    }

    #[test]
    fn duplicate_ids_keep_latest_regardless_of_source_order() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": [entry("1235", 200), entry("1235", 100)],
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].expires_at, 200);
    }

    #[test]
    fn oversized_response_truncates_keeping_greatest_expiries() {
        let entries: Vec<_> = (0i64..25).map(|i| entry(&format!("tx-{i}"), 1000 + i)).collect();
        let raw = parse_raw(json!({"status": 0, "latest_receipt_info": entries}));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), MAX_RECEIPT_ENTRIES);
        // Ascending order, so the first survivor is the 6th-oldest entry.
        assert_eq!(canonical[0].expires_at, 1005);
        assert_eq!(canonical.last().unwrap().expires_at, 1024);
    }

    #[test]
    fn entries_without_expiry_are_dropped() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": [
                entry("1234", 100),
                {
                    "original_transaction_id": "9999",
                    "product_id": "com.example.consumable",
                    "original_purchase_date_ms": "1567081703000",
                },
            ],
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].original_transaction_id, "1234");
    }

    #[test]
    fn expired_receipt_info_is_the_fallback_source() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_expired_receipt_info": entry("5678", 400),
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].original_transaction_id, "5678");
    }

    #[test]
    fn missing_receipt_info_is_fatal() {
        let raw = parse_raw(json!({"status": 0}));
        let err = normalize(&raw).unwrap_err();
        assert!(matches!(err, IngestError::MissingReceiptInfo));
    }

    #[test]
    fn unparseable_original_purchase_date_is_fatal() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "expires_date_ms": "200",
                "original_purchase_date": "not-a-date",
            },
        }));

        let err = normalize(&raw).unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
    }

    #[test]
    fn auto_renew_joins_pending_renewal_by_transaction_id() {
        let raw = parse_raw(json!({
            "status": 0,
            "auto_renew_status": "0",
            "latest_receipt_info": [entry("1234", 100), entry("5678", 200)],
            "pending_renewal_info": [
                {"original_transaction_id": "1234", "auto_renew_status": "1"},
            ],
        }));

        let canonical = normalize(&raw).unwrap();
        let by_id: HashMap<_, _> = canonical
            .iter()
            .map(|c| (c.original_transaction_id.as_str(), c.auto_renew_status))
            .collect();
        // Joined entry takes the renewal-info flag; unmatched entry falls
        // back to the response-level flag.
        assert_eq!(by_id["1234"], true);
        assert_eq!(by_id["5678"], false);
    }

    #[test]
    fn bundle_id_falls_back_through_payload_locations() {
        let raw = parse_raw(json!({
            "status": 0,
            "receipt": {"bid": "com.example.legacy"},
            "latest_receipt_info": entry("1234", 100),
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical[0].bundle_id.as_deref(), Some("com.example.legacy"));
    }

    #[test]
    fn entry_bundle_id_wins_over_top_level() {
        let raw = parse_raw(json!({
            "status": 0,
            "receipt": {"bundle_id": "com.example.toplevel"},
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "bundle_id": "com.example.entry",
                "expires_date_ms": "100",
                "original_purchase_date_ms": "50",
            },
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical[0].bundle_id.as_deref(), Some("com.example.entry"));
    }

    #[test]
    fn missing_bundle_id_is_logged_not_fatal() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": entry("1234", 100),
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical[0].bundle_id, None);
    }

    #[test]
    fn numeric_fields_coerce_to_strings() {
        // Older storefront payloads send numbers where strings are expected.
        let raw = parse_raw(json!({
            "status": "0",
            "latest_receipt_info": {
                "original_transaction_id": 1234,
                "product_id": "P",
                "expires_date_ms": 1570705794000_i64,
                "original_purchase_date_ms": 1567081703000_i64,
            },
        }));

        assert_eq!(raw.status, 0);
        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical[0].original_transaction_id, "1234");
        assert_eq!(canonical[0].expires_at, 1570705794000);
    }

    #[test]
    fn trial_and_intro_flags_parse() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "expires_date_ms": "100",
                "original_purchase_date_ms": "50",
                "is_trial_period": "true",
                "is_in_intro_offer_period": "false",
            },
        }));

        let canonical = normalize(&raw).unwrap();
        assert!(canonical[0].trial_period);
        assert!(!canonical[0].intro_offer_period);
    }

    #[test]
    fn cancellation_date_is_optional() {
        let raw = parse_raw(json!({
            "status": 0,
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "expires_date_ms": "100",
                "original_purchase_date_ms": "50",
                "cancellation_date_ms": "75",
            },
        }));

        let canonical = normalize(&raw).unwrap();
        assert_eq!(canonical[0].cancelled_at, Some(75));
    }
}
