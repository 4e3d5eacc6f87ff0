//! Failure taxonomy shared by every pipeline component
//!
//! Three kinds: Retryable (propagate so the transport redelivers),
//! GracefulSkip (valid but not actionable, treat as success), Fatal (drop
//! the record, count it, report success to the transport). Callers branch
//! on [`IngestError::kind`] only, never on raw status codes.

use storesync_shared::StoreError;
use thiserror::Error;

/// The three-way classification every caller branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient external failure; the triggering message must be
    /// redelivered by its transport.
    Retryable,
    /// Valid input that is not actionable in the current environment;
    /// treated as success, never retried.
    GracefulSkip,
    /// Malformed or logically invalid input; dropped and counted.
    Fatal,
}

/// Which storefront environment issued a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Sandbox,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Sandbox => write!(f, "sandbox"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// HTTP transport failed outright.
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx HTTP status.
    #[error("upstream endpoint returned HTTP {0}")]
    UpstreamHttp(u16),

    /// Response-level status in the storefront's reserved server-error
    /// range.
    #[error("storefront reported transient server error (status {0})")]
    UpstreamStatus(i64),

    /// The receipt was issued by the opposite environment and no fallback
    /// was taken.
    #[error("receipt belongs to the {0} environment")]
    WrongEnvironment(Environment),

    /// The storefront rejected the receipt outright.
    #[error("receipt rejected by storefront (status {0})")]
    ReceiptRejected(i64),

    /// Logical success without any receipt info cannot be a success.
    #[error("validation response contained no receipt info")]
    MissingReceiptInfo,

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally present but semantically invalid field.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The storefront no longer knows the referenced purchase.
    #[error("purchase not found at storefront (HTTP {0})")]
    PurchaseGone(u16),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Transport(_)
            | IngestError::UpstreamHttp(_)
            | IngestError::UpstreamStatus(_)
            | IngestError::Store(_) => ErrorKind::Retryable,
            IngestError::WrongEnvironment(_) => ErrorKind::GracefulSkip,
            IngestError::ReceiptRejected(_)
            | IngestError::MissingReceiptInfo
            | IngestError::Json(_)
            | IngestError::Malformed(_)
            | IngestError::PurchaseGone(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
