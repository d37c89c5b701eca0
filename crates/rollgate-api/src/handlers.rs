//! REST API handlers for strategies and workloads.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info};

use rollgate_core::{ObjectTypeRef, RolloutStrategy, epoch_secs};
use rollgate_rollout::{RolloutError, validate_strategy};
use rollgate_state::{StateError, WorkloadRecord, namespaced_key};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_) | StateError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

pub(crate) fn rollout_error(e: &RolloutError) -> Response {
    let status = match e {
        RolloutError::InvalidPlan(_) | RolloutError::UnknownTargetType(_) => {
            StatusCode::BAD_REQUEST
        }
        RolloutError::StrategyNotFound(_) | RolloutError::TargetNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RolloutError::Conflict { .. } => StatusCode::CONFLICT,
        RolloutError::State(inner) => return state_error(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Strategies ─────────────────────────────────────────────────

/// GET /api/v1/strategies
pub async fn list_strategies(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_strategies() {
        Ok(strategies) => ApiResponse::ok(strategies).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/strategies/:namespace/:name
pub async fn get_strategy(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_strategy(&namespaced_key(&namespace, &name)) {
        Ok(Some(strategy)) => ApiResponse::ok(strategy).into_response(),
        Ok(None) => error_response("strategy not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/strategies
///
/// Runs already created from a strategy keep their own snapshot.
pub async fn put_strategy(
    State(state): State<ApiState>,
    Json(strategy): Json<RolloutStrategy>,
) -> impl IntoResponse {
    if let Err(e) = validate_strategy(&strategy) {
        return rollout_error(&e);
    }
    match state.store.put_strategy(&strategy) {
        Ok(()) => {
            info!(strategy = %strategy.table_key(), "strategy stored");
            (StatusCode::CREATED, ApiResponse::ok(strategy)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/strategies/:namespace/:name
pub async fn delete_strategy(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.delete_strategy(&namespaced_key(&namespace, &name)) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("strategy not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

// ── Workloads ──────────────────────────────────────────────────

/// Registration or progress report for a store-managed workload.
///
/// `targetType` is required when the workload is first registered. Labels
/// replace the stored ones when given.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    #[serde(default)]
    pub target_type: Option<ObjectTypeRef>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    pub replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub updated_ready_replicas: u32,
    #[serde(default)]
    pub failed_replicas: u32,
}

/// GET /api/v1/workloads
pub async fn list_workloads(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_workloads() {
        Ok(workloads) => ApiResponse::ok(workloads).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/workloads/:cluster/:namespace/:name
pub async fn get_workload(
    State(state): State<ApiState>,
    Path((cluster, namespace, name)): Path<(String, String, String)>,
) -> impl IntoResponse {
    match state.store.get_workload(&cluster, &namespace, &name) {
        Ok(Some(workload)) => ApiResponse::ok(workload).into_response(),
        Ok(None) => error_response("workload not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/workloads/:cluster/:namespace/:name
///
/// Updates keep the desired state written by runs.
pub async fn report_workload(
    State(state): State<ApiState>,
    Path((cluster, namespace, name)): Path<(String, String, String)>,
    Json(report): Json<WorkloadReport>,
) -> impl IntoResponse {
    let now = epoch_secs();
    let updated = state.store.update_workload(&cluster, &namespace, &name, |w| {
        if let Some(target_type) = report.target_type.clone() {
            w.target_type = target_type;
        }
        if let Some(labels) = report.labels.clone() {
            w.labels = labels;
        }
        w.replicas = report.replicas;
        w.updated_replicas = report.updated_replicas;
        w.updated_ready_replicas = report.updated_ready_replicas;
        w.failed_replicas = report.failed_replicas;
        w.updated_at = now;
    });

    match updated {
        Ok(workload) => {
            debug!(workload = %workload.table_key(), "workload reported");
            state.controller.poke();
            ApiResponse::ok(workload).into_response()
        }
        Err(StateError::NotFound(_)) => {
            let Some(target_type) = report.target_type else {
                return error_response(
                    "targetType is required to register a workload",
                    StatusCode::BAD_REQUEST,
                );
            };
            let workload = WorkloadRecord {
                cluster,
                namespace,
                name,
                target_type,
                labels: report.labels.unwrap_or_default(),
                replicas: report.replicas,
                updated_replicas: report.updated_replicas,
                updated_ready_replicas: report.updated_ready_replicas,
                failed_replicas: report.failed_replicas,
                desired_updated_replicas: None,
                desired_traffic: None,
                owner_run: None,
                updated_at: now,
            };
            match state.store.put_workload(&workload) {
                Ok(()) => {
                    info!(workload = %workload.table_key(), "workload registered");
                    (StatusCode::CREATED, ApiResponse::ok(workload)).into_response()
                }
                Err(e) => state_error(&e),
            }
        }
        Err(e) => state_error(&e),
    }
}
