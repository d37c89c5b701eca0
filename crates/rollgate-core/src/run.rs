//! The run record: immutable spec snapshot, control requests, and status.
//!
//! `RunStatus` is the durable checkpoint of the batch executor. Everything
//! needed to resume a run after a restart lives here; nothing is kept only
//! in memory.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::{HookType, ObjectTypeRef, RolloutWebhook, Step, Toleration, TrafficStrategy};

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Current time as a [`Timestamp`].
pub fn epoch_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Identity and bookkeeping for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Bumped on every change to spec or control.
    pub generation: u64,
    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: Timestamp,
}

/// Snapshot taken when the run is created. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub target_type: ObjectTypeRef,
    /// Strategy the run was compiled from, as `{namespace}/{name}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub batches: Vec<Step>,
    #[serde(default)]
    pub toleration: Toleration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<RolloutWebhook>,
}

/// Requests from operators. The only part of a run they may change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunControl {
    /// Hold the run at the next state boundary while set.
    #[serde(default)]
    pub paused: bool,
    /// Stop the run for good.
    #[serde(default)]
    pub canceled: bool,
    /// Incremented to release a breakpoint.
    #[serde(default)]
    pub resume: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub metadata: RunMeta,
    pub spec: RunSpec,
    #[serde(default)]
    pub control: RunControl,
    #[serde(default)]
    pub status: RunStatus,
}

impl Run {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }
}

// ── Status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    #[default]
    Pending,
    Progressing,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed | RunPhase::Canceled)
    }
}

/// Sub-state of the current batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    Pending,
    Initializing,
    PreBatchStepHook,
    Running,
    PostBatchStepHook,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Failed | StepState::Canceled)
    }

    /// The hook consulted in this state, if any.
    pub fn hook(&self) -> Option<HookType> {
        match self {
            StepState::PreBatchStepHook => Some(HookType::PreBatchStepHook),
            StepState::PostBatchStepHook => Some(HookType::PostBatchStepHook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workload_statuses: Vec<WorkloadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub current_batch: u32,
    pub state: StepState,
    /// Last `RunControl::resume` value acted on.
    #[serde(default)]
    pub observed_resume: u64,
    /// One record per batch started so far, in order.
    #[serde(default)]
    pub records: Vec<BatchRecord>,
}

impl BatchStatus {
    pub fn record(&self, index: u32) -> Option<&BatchRecord> {
        self.records.iter().find(|r| r.index == index)
    }

    pub fn record_mut(&mut self, index: u32) -> Option<&mut BatchRecord> {
        self.records.iter_mut().find(|r| r.index == index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub index: u32,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When target mutation was issued. Set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Traffic requested for this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookRecord>,
}

impl BatchRecord {
    pub fn webhook(&self, hook: HookType, name: &str) -> Option<&WebhookRecord> {
        self.webhooks
            .iter()
            .find(|w| w.hook_type == hook && w.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookState {
    #[default]
    Running,
    Succeeded,
    Failed,
}

/// Persisted outcome of one webhook at one hook point of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRecord {
    pub name: String,
    pub hook_type: HookType,
    pub state: WebhookState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    /// Failed under the Ignore policy.
    #[serde(default)]
    pub ignored: bool,
}

impl WebhookRecord {
    pub fn new(name: &str, hook_type: HookType) -> Self {
        Self {
            name: name.to_string(),
            hook_type,
            state: WebhookState::Running,
            code: None,
            reason: String::new(),
            message: String::new(),
            failure_count: 0,
            first_attempt_at: None,
            last_attempt_at: None,
            ignored: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state != WebhookState::Running
    }
}

/// Replica counts of one target as last reported by its collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub cluster: String,
    pub name: String,
    /// Updated replicas the current batch asks for.
    pub desired_updated_replicas: u32,
    pub replicas: u32,
    pub updated_replicas: u32,
    pub updated_ready_replicas: u32,
    pub failed_replicas: u32,
    #[serde(default)]
    pub degraded: bool,
    pub last_updated_at: Timestamp,
}

// ── Conditions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// The run is advancing (or done advancing).
    Progressing,
    /// The run is held at a breakpoint or by an operator.
    Paused,
    /// The run reached a terminal phase.
    Completed,
    /// A webhook failed under the Ignore policy.
    WebhookIgnored,
    /// A workload exceeded its own failure threshold.
    WorkloadDegraded,
    /// The last reconcile hit a retryable error.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(RunPhase::Succeeded.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(RunPhase::Canceled.is_terminal());
        assert!(!RunPhase::Paused.is_terminal());
        assert!(!RunPhase::Progressing.is_terminal());
    }

    #[test]
    fn hook_states() {
        assert_eq!(StepState::PreBatchStepHook.hook(), Some(HookType::PreBatchStepHook));
        assert_eq!(StepState::PostBatchStepHook.hook(), Some(HookType::PostBatchStepHook));
        assert_eq!(StepState::Running.hook(), None);
    }

    #[test]
    fn empty_status_serializes_compactly() {
        let json = serde_json::to_value(RunStatus::default()).unwrap();
        assert_eq!(json["phase"], "Pending");
        assert!(json.get("batchStatus").is_none());
        assert!(json.get("conditions").is_none());
    }

    #[test]
    fn record_lookup_by_hook_and_name() {
        let record = BatchRecord {
            index: 0,
            webhooks: vec![
                WebhookRecord::new("a", HookType::PreBatchStepHook),
                WebhookRecord::new("a", HookType::PostBatchStepHook),
            ],
            ..Default::default()
        };
        assert!(record.webhook(HookType::PostBatchStepHook, "a").is_some());
        assert!(record.webhook(HookType::PreBatchStepHook, "b").is_none());
    }
}
