//! Toleration monitor — decides whether failed replicas stop a batch.

use rollgate_core::{Timestamp, Toleration, WorkloadStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Named workloads exceeded their own threshold; the batch carries on.
    Degraded(Vec<String>),
    /// The batch-wide threshold was exceeded.
    Abort { failed: u32, tolerated: u32 },
}

/// Whether failures count yet for a batch whose upgrade started at
/// `started_at`.
pub fn failures_counted(policy: &Toleration, started_at: Timestamp, now: Timestamp) -> bool {
    now >= started_at.saturating_add(u64::from(policy.initial_delay_seconds))
}

/// Evaluate the observed workloads of one batch.
pub fn evaluate(
    statuses: &[WorkloadStatus],
    started_at: Timestamp,
    now: Timestamp,
    policy: &Toleration,
) -> Verdict {
    if !failures_counted(policy, started_at, now) {
        return Verdict::Continue;
    }

    let total: u32 = statuses.iter().map(|s| s.replicas).sum();
    let failed: u32 = statuses.iter().map(|s| s.failed_replicas).sum();
    let tolerated = policy.task_failure_threshold.resolve_threshold(total);
    if failed > tolerated {
        return Verdict::Abort { failed, tolerated };
    }

    let degraded: Vec<String> = statuses
        .iter()
        .filter(|s| {
            s.failed_replicas > policy.workload_failure_threshold.resolve_threshold(s.replicas)
        })
        .map(|s| format!("{}/{}", s.cluster, s.name))
        .collect();

    if degraded.is_empty() {
        Verdict::Continue
    } else {
        Verdict::Degraded(degraded)
    }
}
