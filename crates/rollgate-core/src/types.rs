//! Declarative types: strategies, steps, traffic, toleration, webhooks.
//!
//! Field names serialize in camelCase to match the JSON accepted by the
//! REST API and sent to webhooks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intstr::IntOrPercent;
use crate::selector::LabelSelector;

// ── References ────────────────────────────────────────────────────

/// Group/version/kind of the workload being rolled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeRef {
    pub api_version: String,
    pub kind: String,
}

impl ObjectTypeRef {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for ObjectTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// A named object in a specific cluster. The namespace is the run's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrossClusterObjectRef {
    pub cluster: String,
    pub name: String,
}

impl CrossClusterObjectRef {
    pub fn new(cluster: &str, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CrossClusterObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.name)
    }
}

/// A candidate target offered to the plan compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    #[serde(flatten)]
    pub object: CrossClusterObjectRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// ── Traffic ───────────────────────────────────────────────────────

/// Desired traffic shaping for a step. Only the decision is recorded;
/// routing is the workload collaborator's business.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStrategy {
    /// Percentage of traffic the canary replicas should receive (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpTrafficStrategy>,
}

impl TrafficStrategy {
    pub fn is_empty(&self) -> bool {
        self.weight.is_none() && self.http.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTrafficStrategy {
    /// Requests matching any entry are sent to the canary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpRouteMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header_modifier: Option<HttpHeaderFilter>,
}

/// Header matchers are ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRouteMatch {
    #[serde(default)]
    pub headers: Vec<HttpHeaderMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaderMatch {
    #[serde(default, rename = "type")]
    pub match_type: HeaderMatchType,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderMatchType {
    #[default]
    Exact,
    RegularExpression,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaderFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

// ── Steps ─────────────────────────────────────────────────────────

/// User-facing step in a strategy.
///
/// `replicas` is cumulative: the number of replicas of each matched
/// target that should be upgraded once the step is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStep {
    #[serde(flatten)]
    pub traffic: TrafficStrategy,
    pub replicas: IntOrPercent,
    /// Restrict the step to candidates matching this selector.
    #[serde(default, rename = "matchTargets", skip_serializing_if = "Option::is_none")]
    pub matches: Option<LabelSelector>,
    /// Explicit targets; takes precedence over `matches`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<StepTarget>,
    #[serde(default)]
    pub breakpoint: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// A target of a compiled step with its cumulative desired replicas.
///
/// Fast-batch steps also carry a [`FastShare`]; when present it decides the
/// desired count and `replicas` is only the approximate percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTarget {
    #[serde(flatten)]
    pub object: CrossClusterObjectRef,
    pub replicas: IntOrPercent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<FastShare>,
}

impl StepTarget {
    pub fn new(object: CrossClusterObjectRef, replicas: IntOrPercent) -> Self {
        Self {
            object,
            replicas,
            share: None,
        }
    }

    /// Cumulative updated replicas wanted out of `total`.
    pub fn desired_replicas(&self, total: u32) -> u32 {
        match &self.share {
            Some(share) => share.resolve(total),
            None => self.replicas.resolve(total),
        }
    }
}

/// Position of a generated fast batch among the non-beta batches.
///
/// What the beta batch took is set aside first; the rest is split by
/// integer division and the last batch picks up the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FastShare {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<IntOrPercent>,
    /// 1-based.
    pub batch: u32,
    pub of: u32,
}

impl FastShare {
    pub fn resolve(&self, total: u32) -> u32 {
        if self.batch >= self.of {
            return total;
        }
        let beta = self.beta.map_or(0, |b| b.resolve(total));
        let rest = total - beta;
        beta + self.batch * (rest / self.of)
    }
}

/// Canonical, compiled step. Always carries explicit targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(flatten)]
    pub traffic: TrafficStrategy,
    pub targets: Vec<StepTarget>,
    /// Pause after this step completes.
    #[serde(default)]
    pub breakpoint: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

// ── Batch strategy ───────────────────────────────────────────────

/// Where a fast-batch plan places breakpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseMode {
    #[default]
    Never,
    FirstBatch,
    EachBatch,
}

/// Optional first step of a fast-batch plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastBetaBatch {
    #[serde(flatten)]
    pub traffic: TrafficStrategy,
    pub replicas: IntOrPercent,
}

/// Generator for `count` evenly sized batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FastBatch {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<FastBetaBatch>,
    /// Indices of batches that get a breakpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paused_batches: Vec<u32>,
    #[serde(default)]
    pub pause_mode: PauseMode,
}

/// Either explicit steps or a fast-batch generator. Exactly one must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_batch: Option<FastBatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<StrategyStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration: Option<Toleration>,
}

// ── Toleration ───────────────────────────────────────────────────

/// Failure tolerance. Zero thresholds mean no failed replica is tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Failed replicas tolerated within one workload.
    #[serde(default, alias = "workloadTotalFailureThreshold")]
    pub workload_failure_threshold: IntOrPercent,
    /// Failed replicas tolerated across the whole batch.
    #[serde(default)]
    pub task_failure_threshold: IntOrPercent,
    /// Seconds after a batch starts before failures are counted.
    #[serde(default)]
    pub initial_delay_seconds: u32,
}

// ── Webhooks ─────────────────────────────────────────────────────

/// Points in a batch where webhooks are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    PreBatchStepHook,
    PostBatchStepHook,
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookType::PreBatchStepHook => f.write_str("PreBatchStepHook"),
            HookType::PostBatchStepHook => f.write_str("PostBatchStepHook"),
        }
    }
}

/// What happens once a webhook has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Record a warning and carry on.
    Ignore,
    /// Fail the run.
    #[default]
    Fail,
}

pub const DEFAULT_WEBHOOK_TIMEOUT_SECONDS: u32 = 10;
pub const DEFAULT_WEBHOOK_PERIOD_SECONDS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookClientConfig {
    pub url: String,
    /// Total time budget for the webhook, counted from the first attempt.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    /// Seconds between attempts.
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u32,
}

fn default_timeout_seconds() -> u32 {
    DEFAULT_WEBHOOK_TIMEOUT_SECONDS
}

fn default_period_seconds() -> u32 {
    DEFAULT_WEBHOOK_PERIOD_SECONDS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutWebhook {
    pub name: String,
    /// Failures allowed before the policy applies. Zero behaves as one.
    #[serde(default)]
    pub failure_threshold: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub hook_types: Vec<HookType>,
    pub client_config: WebhookClientConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl RolloutWebhook {
    pub fn participates_in(&self, hook: HookType) -> bool {
        self.hook_types.contains(&hook)
    }

    pub fn effective_failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

// ── Strategy ─────────────────────────────────────────────────────

/// Reusable named strategy that runs are created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    pub namespace: String,
    pub name: String,
    pub batch: BatchStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<RolloutWebhook>,
}

impl RolloutStrategy {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
