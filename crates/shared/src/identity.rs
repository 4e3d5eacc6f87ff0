//! Identity service interface
//!
//! Exchanges the storefront-provided external account token for an internal
//! identity. Failures here are non-fatal to the surrounding reconciliation.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("unknown external token")]
    UnknownToken,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn exchange_token(&self, external_token: &str) -> Result<String, IdentityError>;
}
