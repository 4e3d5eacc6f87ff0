//! Historical queue interface
//!
//! At-least-once JSON delivery; consumers of the historical queue are out
//! of scope.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue send failed: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn send(&self, queue_url: &str, json_body: &str) -> Result<(), QueueError>;
}
