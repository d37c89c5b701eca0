//! Router test helpers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use rollgate_core::config::ControllerConfig;
use rollgate_rollout::{BatchExecutor, RunController, WorkloadRegistry};
use rollgate_state::StateStore;
use rollgate_webhook::{HttpWebhookClient, WebhookGate};
use tower::ServiceExt;

use crate::{ApiState, build_router};

pub fn test_state() -> ApiState {
    let store = StateStore::open_in_memory().unwrap();
    let executor = BatchExecutor::new(
        WorkloadRegistry::new(),
        WebhookGate::new(Arc::new(HttpWebhookClient::default())),
        Duration::from_secs(1),
    );
    let controller = RunController::new(store.clone(), executor, ControllerConfig::default());
    ApiState {
        store,
        controller: controller.handle(),
    }
}

/// Send one request through a fresh router and decode the JSON body.
pub async fn send(
    state: &ApiState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            req = req.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = build_router(state.clone())
        .oneshot(req.body(body).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}
