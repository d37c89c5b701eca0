//! Webhook wire contract and the HTTP client that speaks it.
//!
//! The review is POSTed as JSON; the webhook answers with a code of `OK`,
//! `Processing` (ask again later) or `Error`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use rollgate_core::{HookType, IntOrPercent, TrafficStrategy};

use crate::error::{WebhookError, WebhookResult};

/// Longest response body excerpt kept in error messages.
const MAX_BODY_EXCERPT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub cluster: String,
    pub name: String,
    pub replicas: IntOrPercent,
}

/// Request body sent to a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReview {
    pub run: RunIdentity,
    pub hook_type: HookType,
    pub batch_index: u32,
    pub batch_count: u32,
    /// Webhook properties overlaid with the step's properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: Vec<TargetSummary>,
    #[serde(default, skip_serializing_if = "TrafficStrategy::is_empty")]
    pub traffic: TrafficStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    #[serde(rename = "OK")]
    Ok,
    Processing,
    Error,
}

/// Response body expected from a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub code: ResponseCode,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Something that can deliver a review to a webhook URL.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// Deliver `review` to `url`, giving up after `timeout`.
    async fn call(
        &self,
        url: &str,
        review: &WebhookReview,
        timeout: Duration,
    ) -> WebhookResult<WebhookResponse>;
}

/// hyper-based HTTP/1 webhook client.
#[derive(Debug, Clone)]
pub struct HttpWebhookClient {
    user_agent: String,
}

impl HttpWebhookClient {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
        }
    }
}

impl Default for HttpWebhookClient {
    fn default() -> Self {
        Self::new(concat!("rollgate-webhook/", env!("CARGO_PKG_VERSION")))
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn call(
        &self,
        url: &str,
        review: &WebhookReview,
        timeout: Duration,
    ) -> WebhookResult<WebhookResponse> {
        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            WebhookError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(WebhookError::UnsupportedScheme(other.to_string())),
            None => {
                return Err(WebhookError::InvalidUrl {
                    url: url.to_string(),
                    reason: "missing scheme".to_string(),
                });
            }
        }

        let body = serde_json::to_vec(review).map_err(|e| WebhookError::Encode(e.to_string()))?;

        match tokio::time::timeout(timeout, self.post(&uri, body)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%uri, ?timeout, "webhook call timed out");
                Err(WebhookError::Timeout(timeout))
            }
        }
    }
}

impl HttpWebhookClient {
    async fn post(&self, uri: &http::Uri, body: Vec<u8>) -> WebhookResult<WebhookResponse> {
        let authority = uri.authority().ok_or_else(|| WebhookError::InvalidUrl {
            url: uri.to_string(),
            reason: "missing host".to_string(),
        })?;
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| WebhookError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| WebhookError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::HOST, authority.as_str())
            .header(http::header::USER_AGENT, &self.user_agent)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| WebhookError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| WebhookError::Request(e.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| WebhookError::Request(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            debug!(%status, %uri, "webhook returned non-2xx");
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body: excerpt(&bytes),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| WebhookError::Decode(e.to_string()))
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
