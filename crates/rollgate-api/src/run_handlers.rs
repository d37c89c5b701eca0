//! REST API handlers for runs.
//!
//! Control endpoints only touch the run's control fields; the controller
//! picks the change up on its next pass, which they trigger right away.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use rollgate_core::{RunControl, epoch_secs};
use rollgate_rollout::RunRequest;
use rollgate_state::namespaced_key;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, rollout_error, state_error};

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub namespace: Option<String>,
}

/// GET /api/v1/runs
pub async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<ListRunsQuery>,
) -> impl IntoResponse {
    match state.store.list_runs() {
        Ok(mut runs) => {
            if let Some(ns) = &query.namespace {
                runs.retain(|r| &r.metadata.namespace == ns);
            }
            ApiResponse::ok(runs).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/runs
pub async fn create_run(
    State(state): State<ApiState>,
    Json(req): Json<RunRequest>,
) -> impl IntoResponse {
    match rollgate_rollout::create_run(&state.store, req, epoch_secs()) {
        Ok(run) => {
            state.controller.poke();
            (StatusCode::CREATED, ApiResponse::ok(run)).into_response()
        }
        Err(e) => rollout_error(&e),
    }
}

/// GET /api/v1/runs/:namespace/:name
pub async fn get_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_run(&namespaced_key(&namespace, &name)) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/runs/:namespace/:name
///
/// Workloads keep whatever the run already applied.
pub async fn delete_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.delete_run(&namespaced_key(&namespace, &name)) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("run not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/runs/:namespace/:name/pause
pub async fn pause_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    control(&state, &namespace, &name, "pause", |c| c.paused = true)
}

/// POST /api/v1/runs/:namespace/:name/resume
///
/// Clears an operator hold and releases a breakpoint the run is waiting at.
pub async fn resume_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    control(&state, &namespace, &name, "resume", |c| {
        c.paused = false;
        c.resume += 1;
    })
}

/// POST /api/v1/runs/:namespace/:name/cancel
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    control(&state, &namespace, &name, "cancel", |c| c.canceled = true)
}

fn control<F>(state: &ApiState, namespace: &str, name: &str, action: &str, f: F) -> Response
where
    F: FnOnce(&mut RunControl),
{
    let key = namespaced_key(namespace, name);
    match state.store.get_run(&key) {
        Ok(Some(run)) if run.is_terminal() => {
            return error_response(
                &format!("run {key} already finished ({:?})", run.status.phase),
                StatusCode::CONFLICT,
            );
        }
        Ok(Some(_)) => {}
        Ok(None) => return error_response("run not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    }

    match state.store.update_run_control(&key, f) {
        Ok(run) => {
            info!(run = %key, action, "run control updated");
            state.controller.poke();
            ApiResponse::ok(run).into_response()
        }
        Err(e) => state_error(&e),
    }
}
