//! Webhook client error types.

use thiserror::Error;

/// Result type alias for webhook calls.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Why a single webhook call did not produce a decodable answer.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("webhook call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode review: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}
