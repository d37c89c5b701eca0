//! Run creation: resolve the strategy and candidates, compile, persist.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use rollgate_core::{
    BatchStrategy, ObjectTypeRef, RolloutWebhook, Run, RunControl, RunMeta, RunStatus, Timestamp,
    WorkloadRef,
};
use rollgate_state::{StateStore, namespaced_key};

use crate::error::{RolloutError, RolloutResult};
use crate::plan::compile_run_spec;

/// Request to start a run.
///
/// Exactly one of `strategy` (a `name` in the run's namespace, or
/// `namespace/name`) and an inline `batch` must be given. Without explicit
/// `targets`, every stored workload of `targetType` in the namespace is a
/// candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub namespace: String,
    pub name: String,
    pub target_type: ObjectTypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchStrategy>,
    /// Appended to the strategy's webhooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<RolloutWebhook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<WorkloadRef>,
}

/// Compile `req` into a new run and store it.
pub fn create_run(store: &StateStore, req: RunRequest, now: Timestamp) -> RolloutResult<Run> {
    if req.namespace.is_empty() || req.name.is_empty() {
        return Err(RolloutError::invalid("namespace and name are required"));
    }

    let (strategy_key, batch, mut webhooks) = match (&req.strategy, req.batch) {
        (Some(_), Some(_)) => {
            return Err(RolloutError::invalid(
                "strategy and batch are mutually exclusive",
            ));
        }
        (None, None) => return Err(RolloutError::invalid("one of strategy or batch is required")),
        (Some(name), None) => {
            let key = if name.contains('/') {
                name.clone()
            } else {
                namespaced_key(&req.namespace, name)
            };
            let strategy = store
                .get_strategy(&key)?
                .ok_or_else(|| RolloutError::StrategyNotFound(key.clone()))?;
            (Some(key), strategy.batch, strategy.webhooks)
        }
        (None, Some(batch)) => (None, batch, Vec::new()),
    };
    webhooks.extend(req.webhooks);

    let candidates = if req.targets.is_empty() {
        store
            .list_workloads_in_namespace(&req.namespace)?
            .into_iter()
            .filter(|w| w.target_type == req.target_type)
            .map(|w| WorkloadRef {
                object: rollgate_core::CrossClusterObjectRef {
                    cluster: w.cluster,
                    name: w.name,
                },
                labels: w.labels,
            })
            .collect()
    } else {
        req.targets
    };

    let spec = compile_run_spec(req.target_type, strategy_key, &batch, &webhooks, &candidates)?;

    let mut run = Run {
        metadata: RunMeta {
            uid: new_uid(&req.namespace, &req.name),
            namespace: req.namespace,
            name: req.name,
            generation: 1,
            resource_version: 0,
            created_at: now,
        },
        spec,
        control: RunControl::default(),
        status: RunStatus::default(),
    };
    store.create_run(&mut run)?;

    info!(
        run = %run.table_key(),
        uid = %run.metadata.uid,
        batches = run.spec.batches.len(),
        targets = candidates.len(),
        "run created"
    );
    Ok(run)
}

fn new_uid(namespace: &str, name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = Sha256::digest(format!("{namespace}/{name}/{nanos}").as_bytes());
    hex::encode(&digest[..8])
}
