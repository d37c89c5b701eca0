//! Status aggregator — folds observations into the run's status.
//!
//! Conditions form an append-only history. A new entry is only added when
//! it differs from the latest entry of the same type, so re-observing the
//! same state leaves the status untouched.

use rollgate_core::{
    Condition, ConditionStatus, ConditionType, RunStatus, Step, Timestamp, WorkloadStatus,
};

use crate::target::TargetStatus;

/// Oldest entries are dropped beyond this many conditions.
pub const MAX_CONDITIONS: usize = 32;

/// Record a condition. Returns false if it repeats the latest entry of
/// its type.
pub fn set_condition(
    status: &mut RunStatus,
    condition_type: ConditionType,
    condition_status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: Timestamp,
) -> bool {
    let message = message.into();
    let repeated = latest_condition(status, condition_type).is_some_and(|latest| {
        latest.status == condition_status && latest.reason == reason && latest.message == message
    });
    if repeated {
        return false;
    }

    status.conditions.push(Condition {
        condition_type,
        status: condition_status,
        reason: reason.to_string(),
        message,
        last_transition_time: now,
    });
    if status.conditions.len() > MAX_CONDITIONS {
        let excess = status.conditions.len() - MAX_CONDITIONS;
        status.conditions.drain(..excess);
    }
    true
}

pub fn latest_condition(status: &RunStatus, condition_type: ConditionType) -> Option<&Condition> {
    status
        .conditions
        .iter()
        .rev()
        .find(|c| c.condition_type == condition_type)
}

pub fn is_condition_true(status: &RunStatus, condition_type: ConditionType) -> bool {
    latest_condition(status, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Merge observed target counts into the per-workload records.
///
/// `last_updated_at` only moves when a count changes.
pub fn fold_targets(status: &mut RunStatus, step: &Step, observed: &[TargetStatus], now: Timestamp) {
    for obs in observed {
        let desired = step
            .targets
            .iter()
            .find(|t| t.object.cluster == obs.cluster && t.object.name == obs.name)
            .map(|t| t.desired_replicas(obs.replicas))
            .unwrap_or(0);

        let existing = status
            .workload_statuses
            .iter_mut()
            .find(|w| w.cluster == obs.cluster && w.name == obs.name);

        match existing {
            Some(w) => {
                let changed = w.desired_updated_replicas != desired
                    || w.replicas != obs.replicas
                    || w.updated_replicas != obs.updated_replicas
                    || w.updated_ready_replicas != obs.updated_ready_replicas
                    || w.failed_replicas != obs.failed_replicas;
                if changed {
                    w.desired_updated_replicas = desired;
                    w.replicas = obs.replicas;
                    w.updated_replicas = obs.updated_replicas;
                    w.updated_ready_replicas = obs.updated_ready_replicas;
                    w.failed_replicas = obs.failed_replicas;
                    w.last_updated_at = now;
                }
            }
            None => status.workload_statuses.push(WorkloadStatus {
                cluster: obs.cluster.clone(),
                name: obs.name.clone(),
                desired_updated_replicas: desired,
                replicas: obs.replicas,
                updated_replicas: obs.updated_replicas,
                updated_ready_replicas: obs.updated_ready_replicas,
                failed_replicas: obs.failed_replicas,
                degraded: false,
                last_updated_at: now,
            }),
        }
    }
}

/// The workload records belonging to `step`'s targets.
pub fn step_workloads(status: &RunStatus, step: &Step) -> Vec<WorkloadStatus> {
    status
        .workload_statuses
        .iter()
        .filter(|w| {
            step.targets
                .iter()
                .any(|t| t.object.cluster == w.cluster && t.object.name == w.name)
        })
        .cloned()
        .collect()
}

/// Flag the named workloads (`cluster/name`) as degraded. Flags are never
/// cleared while the run is active.
pub fn mark_degraded(status: &mut RunStatus, names: &[String]) {
    for w in status.workload_statuses.iter_mut() {
        if names.iter().any(|n| *n == format!("{}/{}", w.cluster, w.name)) {
            w.degraded = true;
        }
    }
}

/// Whether every workload reached its desired updated count with those
/// replicas ready, or failed once failures are tolerated.
pub fn step_complete(workloads: &[WorkloadStatus], count_failed: bool) -> bool {
    workloads.iter().all(|w| {
        let failed = if count_failed { w.failed_replicas } else { 0 };
        w.updated_replicas >= w.desired_updated_replicas
            && w.updated_ready_replicas + failed >= w.desired_updated_replicas
    })
}
