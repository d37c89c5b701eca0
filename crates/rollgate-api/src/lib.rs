//! rollgate-api — REST API for rollgate.
//!
//! Provides axum route handlers for managing rollout strategies, starting
//! and steering runs, and reporting the state of store-managed workloads.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/strategies` | List strategies |
//! | POST | `/api/v1/strategies` | Create or replace a strategy |
//! | GET | `/api/v1/strategies/{namespace}/{name}` | Get a strategy |
//! | DELETE | `/api/v1/strategies/{namespace}/{name}` | Delete a strategy |
//! | GET | `/api/v1/runs` | List runs (`?namespace=` filter) |
//! | POST | `/api/v1/runs` | Start a run |
//! | GET | `/api/v1/runs/{namespace}/{name}` | Get a run with its status |
//! | DELETE | `/api/v1/runs/{namespace}/{name}` | Delete a run |
//! | POST | `/api/v1/runs/{namespace}/{name}/pause` | Hold at the next boundary |
//! | POST | `/api/v1/runs/{namespace}/{name}/resume` | Clear a hold, release a breakpoint |
//! | POST | `/api/v1/runs/{namespace}/{name}/cancel` | Stop the run |
//! | GET | `/api/v1/workloads` | List workloads |
//! | GET | `/api/v1/workloads/{cluster}/{namespace}/{name}` | Get a workload |
//! | PUT | `/api/v1/workloads/{cluster}/{namespace}/{name}` | Register or report a workload |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod run_handlers;

#[cfg(test)]
mod testing;

use axum::Router;
use axum::routing::{get, post};
use rollgate_rollout::ControllerHandle;
use rollgate_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    /// Poked after every write that a run should react to.
    pub controller: ControllerHandle,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/strategies",
            get(handlers::list_strategies).post(handlers::put_strategy),
        )
        .route(
            "/strategies/{namespace}/{name}",
            get(handlers::get_strategy).delete(handlers::delete_strategy),
        )
        .route(
            "/runs",
            get(run_handlers::list_runs).post(run_handlers::create_run),
        )
        .route(
            "/runs/{namespace}/{name}",
            get(run_handlers::get_run).delete(run_handlers::delete_run),
        )
        .route("/runs/{namespace}/{name}/pause", post(run_handlers::pause_run))
        .route("/runs/{namespace}/{name}/resume", post(run_handlers::resume_run))
        .route("/runs/{namespace}/{name}/cancel", post(run_handlers::cancel_run))
        .route("/workloads", get(handlers::list_workloads))
        .route(
            "/workloads/{cluster}/{namespace}/{name}",
            get(handlers::get_workload).put(handlers::report_workload),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}
