//! Receipt validation client
//!
//! Posts a receipt blob to the stage-appropriate validation endpoint and
//! triages the response-level status into the failure taxonomy. At most two
//! outbound calls are ever made: the primary one, plus a single fallback
//! against the opposite environment when the receipt turns out to belong
//! there. Redelivery-driven retry belongs to the transport, not here.

use storesync_shared::{IngestConfig, Stage};

use crate::error::{Environment, IngestError, IngestResult};
use crate::receipt::{normalize, CanonicalReceiptInfo, RawValidationResponse};

// Response-level status codes (distinct from the HTTP status).
const STATUS_OK: i64 = 0;
/// Receipt is valid but the subscription has expired; still carries
/// receipt info and is a logical success.
const STATUS_SUBSCRIPTION_EXPIRED: i64 = 21006;
/// Sandbox receipt sent to the production endpoint.
const STATUS_SANDBOX_RECEIPT: i64 = 21007;
/// Production receipt sent to the sandbox endpoint.
const STATUS_PRODUCTION_RECEIPT: i64 = 21008;
/// Transient storefront-side failures.
const STATUS_SERVER_UNAVAILABLE: i64 = 21005;
const STATUS_DATA_ACCESS_RETRY: i64 = 21009;
const STATUS_INTERNAL_ERROR_MIN: i64 = 21100;
const STATUS_INTERNAL_ERROR_MAX: i64 = 21199;

fn is_server_error_status(status: i64) -> bool {
    matches!(status, STATUS_SERVER_UNAVAILABLE | STATUS_DATA_ACCESS_RETRY)
        || (STATUS_INTERNAL_ERROR_MIN..=STATUS_INTERNAL_ERROR_MAX).contains(&status)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Permit one re-POST against the opposite environment when the
    /// receipt was issued there.
    pub allow_sandbox_retry: bool,
}

#[derive(Clone)]
pub struct ReceiptValidationClient {
    http: reqwest::Client,
    config: IngestConfig,
}

impl ReceiptValidationClient {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Validate a receipt blob and return the normalized canonical entries.
    ///
    /// Failure classification:
    /// - transport failure / non-2xx HTTP / server-error status → Retryable
    /// - wrong environment without fallback → GracefulSkip
    /// - rejected receipt, malformed body, success without receipt info →
    ///   Fatal
    pub async fn validate(
        &self,
        receipt_blob: &str,
        options: ValidateOptions,
    ) -> IngestResult<Vec<CanonicalReceiptInfo>> {
        let primary = self.config.primary_validation_url();
        let raw = self.post_receipt(primary, receipt_blob).await?;

        match self.triage(&raw) {
            // Only the sandbox-receipt status is eligible for the fallback
            // call; see the wrong-environment policy note on triage().
            Err(IngestError::WrongEnvironment(Environment::Sandbox))
                if options.allow_sandbox_retry =>
            {
                let fallback = self.config.fallback_validation_url();
                tracing::info!(
                    stage = %self.config.stage,
                    "Sandbox receipt reached the production endpoint, retrying once against sandbox"
                );
                let raw = self.post_receipt(fallback, receipt_blob).await?;
                // Second triage runs without another fallback: a receipt
                // rejected by both environments is not actionable here.
                self.triage(&raw)?;
                normalize(&raw)
            }
            Err(e) => Err(e),
            Ok(()) => normalize(&raw),
        }
    }

    async fn post_receipt(
        &self,
        endpoint: &str,
        receipt_blob: &str,
    ) -> IngestResult<RawValidationResponse> {
        let body = serde_json::json!({
            "receipt-data": receipt_blob,
            "password": self.config.validation_secret,
            "exclude-old-transactions": true,
        });

        let response = self.http.post(endpoint).json(&body).send().await?;

        let http_status = response.status();
        if !http_status.is_success() {
            tracing::warn!(
                endpoint = %endpoint,
                http_status = %http_status,
                "Validation endpoint returned non-2xx HTTP status"
            );
            return Err(IngestError::UpstreamHttp(http_status.as_u16()));
        }

        let text = response.text().await?;
        let raw: RawValidationResponse = serde_json::from_str(&text)?;
        Ok(raw)
    }

    /// Triage the response-level status field. `Ok(())` means the body is a
    /// logical success and safe to normalize.
    fn triage(&self, raw: &RawValidationResponse) -> IngestResult<()> {
        match raw.status {
            STATUS_OK | STATUS_SUBSCRIPTION_EXPIRED => {
                if raw.has_receipt_info() {
                    Ok(())
                } else {
                    // Logical success without a receipt cannot be a success.
                    Err(IngestError::MissingReceiptInfo)
                }
            }
            status if is_server_error_status(status) => {
                tracing::warn!(status = status, "Storefront reported transient server error");
                Err(IngestError::UpstreamStatus(status))
            }
            // Wrong environment is never retryable: redelivery cannot change
            // which environment issued the receipt. Only the sandbox-receipt
            // case may take the single fallback call; without it, both cases
            // classify as a graceful skip.
            STATUS_SANDBOX_RECEIPT => Err(IngestError::WrongEnvironment(Environment::Sandbox)),
            STATUS_PRODUCTION_RECEIPT => {
                Err(IngestError::WrongEnvironment(Environment::Production))
            }
            status => {
                tracing::error!(
                    status = status,
                    stage = %self.config.stage,
                    "Storefront rejected receipt"
                );
                Err(IngestError::ReceiptRejected(status))
            }
        }
    }

    pub fn stage(&self) -> Stage {
        self.config.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn config_for(server_url: &str, stage: Stage) -> IngestConfig {
        IngestConfig {
            stage,
            validation_secret: "shared-secret".to_string(),
            production_validation_url: format!("{server_url}/prod/verifyReceipt"),
            sandbox_validation_url: format!("{server_url}/sandbox/verifyReceipt"),
            play_api_url: format!("{server_url}/play"),
            history_queue_url: "https://queue.example/history".to_string(),
        }
    }

    fn active_receipt_body() -> String {
        json!({
            "status": 0,
            "latest_receipt_info": {
                "original_transaction_id": "1234",
                "product_id": "P",
                "expires_date_ms": "1570705794000",
                "original_purchase_date_ms": "1567081703000",
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn valid_receipt_round_trips_to_canonical_entries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/prod/verifyReceipt")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_body(active_receipt_body())
            .expect(1)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let canonical = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].original_transaction_id, "1234");
    }

    #[tokio::test]
    async fn request_body_carries_secret_and_excludes_old_transactions() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/prod/verifyReceipt")
            .match_body(mockito::Matcher::Json(json!({
                "receipt-data": "blob",
                "password": "shared-secret",
                "exclude-old-transactions": true,
            })))
            .with_status(200)
            .with_body(active_receipt_body())
            .expect(1)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_5xx_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(503)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[tokio::test]
    async fn server_error_status_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21005}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UpstreamStatus(21005)));
        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[tokio::test]
    async fn internal_error_range_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21150}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[tokio::test]
    async fn wrong_environment_falls_back_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let prod_mock = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21007}).to_string())
            .expect(1)
            .create_async()
            .await;
        let sandbox_mock = server
            .mock("POST", "/sandbox/verifyReceipt")
            .with_status(200)
            .with_body(active_receipt_body())
            .expect(1)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let canonical = client
            .validate("blob", ValidateOptions { allow_sandbox_retry: true })
            .await
            .unwrap();

        prod_mock.assert_async().await;
        sandbox_mock.assert_async().await;
        assert_eq!(canonical.len(), 1);
    }

    #[tokio::test]
    async fn wrong_environment_without_retry_is_graceful_skip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21007}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::GracefulSkip);
    }

    #[tokio::test]
    async fn production_receipt_on_sandbox_is_graceful_skip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sandbox/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21008}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Dev));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::WrongEnvironment(Environment::Production)
        ));
        assert_eq!(err.kind(), ErrorKind::GracefulSkip);
    }

    #[tokio::test]
    async fn production_receipt_never_takes_the_fallback() {
        let mut server = mockito::Server::new_async().await;
        let prod_mock = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21008}).to_string())
            .expect(1)
            .create_async()
            .await;
        let sandbox_mock = server
            .mock("POST", "/sandbox/verifyReceipt")
            .expect(0)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions { allow_sandbox_retry: true })
            .await
            .unwrap_err();

        prod_mock.assert_async().await;
        sandbox_mock.assert_async().await;
        assert_eq!(err.kind(), ErrorKind::GracefulSkip);
    }

    #[tokio::test]
    async fn wrong_environment_on_fallback_does_not_loop() {
        let mut server = mockito::Server::new_async().await;
        let prod_mock = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21007}).to_string())
            .expect(1)
            .create_async()
            .await;
        let sandbox_mock = server
            .mock("POST", "/sandbox/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21008}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions { allow_sandbox_retry: true })
            .await
            .unwrap_err();

        prod_mock.assert_async().await;
        sandbox_mock.assert_async().await;
        assert_eq!(err.kind(), ErrorKind::GracefulSkip);
    }

    #[tokio::test]
    async fn rejected_receipt_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 21003}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::ReceiptRejected(21003)));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn success_without_receipt_info_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({"status": 0}).to_string())
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::MissingReceiptInfo));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn malformed_response_body_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Prod));
        let err = client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn dev_stage_posts_to_sandbox_first() {
        let mut server = mockito::Server::new_async().await;
        let sandbox_mock = server
            .mock("POST", "/sandbox/verifyReceipt")
            .with_status(200)
            .with_body(active_receipt_body())
            .expect(1)
            .create_async()
            .await;

        let client = ReceiptValidationClient::new(config_for(&server.url(), Stage::Dev));
        client
            .validate("blob", ValidateOptions::default())
            .await
            .unwrap();

        sandbox_mock.assert_async().await;
    }
}
