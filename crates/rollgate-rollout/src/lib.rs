//! rollgate-rollout — progressive batch release engine.
//!
//! A run releases a new version to a set of workloads spread over several
//! clusters, one batch at a time. Between batches it can stop at
//! breakpoints, consult webhooks, and abort when too many replicas fail.
//!
//! # Architecture
//!
//! ```text
//! RunRequest ──► request::create_run
//!                  └── plan::compile_run_spec → Vec<Step> → StateStore
//!
//! RunController (loop: due runs, bounded concurrency, backoff)
//!   └── reconcile_key(key)  read → reconcile → write (optimistic, retried)
//!         └── BatchExecutor::reconcile(run, now)
//!               ├── WebhookGate            pre/post batch hooks
//!               ├── WorkloadAccessor       apply / status per target type
//!               ├── toleration::evaluate   abort or degrade
//!               └── status::*              conditions, workload records
//! ```
//!
//! Everything the executor learns goes into the run's status, which is the
//! only state that survives a restart.

pub mod controller;
pub mod error;
pub mod executor;
pub mod plan;
pub mod request;
pub mod status;
pub mod target;
pub mod toleration;

#[cfg(test)]
mod testing;

pub use controller::{ControllerHandle, RunController, backoff};
pub use error::{RolloutError, RolloutResult};
pub use executor::{BatchExecutor, ReconcileOutcome};
pub use plan::{compile, compile_run_spec, validate_strategy, validate_webhooks};
pub use request::{RunRequest, create_run};
pub use target::{
    ApplyContext, StoreWorkloads, TargetStatus, WorkloadAccessor, WorkloadRegistry,
};
pub use toleration::Verdict;
