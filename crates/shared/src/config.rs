//! Ingestion pipeline configuration
//!
//! Resolved once per invocation (from the environment or an external
//! configuration collaborator) and injected into each component at
//! construction. Never a module-level singleton.

use thiserror::Error;

/// Deployment stage, decides which validation endpoint is
/// environment-appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prod,
    Dev,
}

impl Stage {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("prod") {
            Stage::Prod
        } else {
            Stage::Dev
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prod => "prod",
            Stage::Dev => "dev",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
}

const DEFAULT_PRODUCTION_VALIDATION_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
const DEFAULT_SANDBOX_VALIDATION_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";
const DEFAULT_PLAY_API_URL: &str =
    "https://androidpublisher.googleapis.com/androidpublisher/v3/applications";

/// Configuration surface consumed by the ingestion core.
///
/// Secrets and URLs arrive as plain strings from the configuration
/// collaborator; this struct only carries them.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub stage: Stage,
    /// Shared secret sent alongside every receipt validation request.
    pub validation_secret: String,
    pub production_validation_url: String,
    pub sandbox_validation_url: String,
    pub play_api_url: String,
    /// Destination for redacted historical subscription events.
    pub history_queue_url: String,
}

impl IngestConfig {
    /// Load configuration from environment variables.
    ///
    /// Endpoint URLs fall back to the storefront defaults; the stage,
    /// secret, and queue URL are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let stage = std::env::var("STAGE")
            .map(|s| Stage::parse(&s))
            .unwrap_or(Stage::Dev);

        let validation_secret = std::env::var("RECEIPT_VALIDATION_SECRET")
            .map_err(|_| ConfigError::MissingVar("RECEIPT_VALIDATION_SECRET"))?;

        let history_queue_url = std::env::var("HISTORY_QUEUE_URL")
            .map_err(|_| ConfigError::MissingVar("HISTORY_QUEUE_URL"))?;

        Ok(Self {
            stage,
            validation_secret,
            production_validation_url: std::env::var("RECEIPT_VALIDATION_URL")
                .unwrap_or_else(|_| DEFAULT_PRODUCTION_VALIDATION_URL.to_string()),
            sandbox_validation_url: std::env::var("RECEIPT_VALIDATION_SANDBOX_URL")
                .unwrap_or_else(|_| DEFAULT_SANDBOX_VALIDATION_URL.to_string()),
            play_api_url: std::env::var("PLAY_API_URL")
                .unwrap_or_else(|_| DEFAULT_PLAY_API_URL.to_string()),
            history_queue_url,
        })
    }

    /// The validation endpoint appropriate for the current stage.
    pub fn primary_validation_url(&self) -> &str {
        match self.stage {
            Stage::Prod => &self.production_validation_url,
            Stage::Dev => &self.sandbox_validation_url,
        }
    }

    /// The opposite environment's endpoint, used for the single
    /// wrong-environment fallback call.
    pub fn fallback_validation_url(&self) -> &str {
        match self.stage {
            Stage::Prod => &self.sandbox_validation_url,
            Stage::Dev => &self.production_validation_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(stage: Stage) -> IngestConfig {
        IngestConfig {
            stage,
            validation_secret: "secret".to_string(),
            production_validation_url: "https://prod.example/verify".to_string(),
            sandbox_validation_url: "https://sandbox.example/verify".to_string(),
            play_api_url: "https://play.example".to_string(),
            history_queue_url: "https://queue.example/history".to_string(),
        }
    }

    #[test]
    fn prod_stage_targets_production_first() {
        let config = test_config(Stage::Prod);
        assert_eq!(config.primary_validation_url(), "https://prod.example/verify");
        assert_eq!(
            config.fallback_validation_url(),
            "https://sandbox.example/verify"
        );
    }

    #[test]
    fn dev_stage_targets_sandbox_first() {
        let config = test_config(Stage::Dev);
        assert_eq!(
            config.primary_validation_url(),
            "https://sandbox.example/verify"
        );
        assert_eq!(config.fallback_validation_url(), "https://prod.example/verify");
    }

    #[test]
    fn stage_parsing_is_case_insensitive() {
        assert_eq!(Stage::parse("PROD"), Stage::Prod);
        assert_eq!(Stage::parse("prod"), Stage::Prod);
        assert_eq!(Stage::parse("staging"), Stage::Dev);
    }
}
