//! Fakes shared by the executor and controller tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use rollgate_core::{
    CrossClusterObjectRef, FailurePolicy, HookType, IntOrPercent, ObjectTypeRef, RolloutWebhook,
    Run, RunControl, RunMeta, RunSpec, RunStatus, Step, StepTarget, Toleration, TrafficStrategy,
    WebhookClientConfig,
};
use rollgate_webhook::{
    ResponseCode, WebhookClient, WebhookError, WebhookResponse, WebhookResult, WebhookReview,
};

use crate::error::{RolloutError, RolloutResult};
use crate::target::{ApplyContext, TargetStatus, WorkloadAccessor};

// ── Workloads ────────────────────────────────────────────────────

struct FakeState {
    replicas: u32,
    workloads: HashMap<String, TargetStatus>,
    converge: bool,
    unreachable: bool,
    apply_calls: usize,
}

/// In-memory workloads. By default applied replicas become ready at once.
pub struct FakeWorkloads {
    state: Mutex<FakeState>,
}

impl FakeWorkloads {
    pub fn with_replicas(replicas: u32) -> Self {
        Self {
            state: Mutex::new(FakeState {
                replicas,
                workloads: HashMap::new(),
                converge: true,
                unreachable: false,
                apply_calls: 0,
            }),
        }
    }

    pub fn set_converge(&self, converge: bool) {
        self.state.lock().unwrap().converge = converge;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Report counts as an agent would.
    pub fn report(&self, name: &str, updated: u32, ready: u32, failed: u32) {
        let mut state = self.state.lock().unwrap();
        let replicas = state.replicas;
        let w = state
            .workloads
            .entry(name.to_string())
            .or_insert_with(|| blank("c1", name, replicas));
        w.updated_replicas = updated;
        w.updated_ready_replicas = ready;
        w.failed_replicas = failed;
    }

    pub fn updated(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(name)
            .map(|w| w.updated_replicas)
            .unwrap_or(0)
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().unwrap().apply_calls
    }
}

fn blank(cluster: &str, name: &str, replicas: u32) -> TargetStatus {
    TargetStatus {
        cluster: cluster.to_string(),
        name: name.to_string(),
        replicas,
        ..Default::default()
    }
}

#[async_trait]
impl WorkloadAccessor for FakeWorkloads {
    async fn apply(&self, _ctx: &ApplyContext<'_>, targets: &[StepTarget]) -> RolloutResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(RolloutError::TargetUnreachable {
                target: targets[0].object.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.apply_calls += 1;
        let (replicas, converge) = (state.replicas, state.converge);
        for target in targets {
            let w = state
                .workloads
                .entry(target.object.name.clone())
                .or_insert_with(|| blank(&target.object.cluster, &target.object.name, replicas));
            if converge {
                let desired = target.desired_replicas(replicas);
                w.updated_replicas = desired;
                w.updated_ready_replicas = desired;
            }
        }
        Ok(())
    }

    async fn status(
        &self,
        _namespace: &str,
        targets: &[CrossClusterObjectRef],
    ) -> RolloutResult<Vec<TargetStatus>> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(RolloutError::TargetUnreachable {
                target: targets[0].to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(targets
            .iter()
            .map(|t| {
                state
                    .workloads
                    .get(&t.name)
                    .cloned()
                    .unwrap_or_else(|| blank(&t.cluster, &t.name, state.replicas))
            })
            .collect())
    }
}

// ── Webhooks ─────────────────────────────────────────────────────

enum Script {
    Always(ResponseCode),
    Queue(VecDeque<ResponseCode>),
}

/// Webhook client answering from per-name scripts. Unscripted names get a
/// connection error.
#[derive(Default)]
pub struct ScriptedWebhooks {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedWebhooks {
    pub fn always(&self, name: &str, code: ResponseCode) {
        self.scripts
            .lock()
            .unwrap()
            .insert(name.to_string(), Script::Always(code));
    }

    pub fn script(&self, name: &str, codes: Vec<ResponseCode>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(name.to_string(), Script::Queue(codes.into()));
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WebhookClient for ScriptedWebhooks {
    async fn call(
        &self,
        url: &str,
        _review: &WebhookReview,
        _timeout: Duration,
    ) -> WebhookResult<WebhookResponse> {
        let name = url.rsplit('/').next().unwrap_or_default().to_string();
        *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;

        let code = match self.scripts.lock().unwrap().get_mut(&name) {
            Some(Script::Always(code)) => Some(*code),
            Some(Script::Queue(queue)) => queue.pop_front(),
            None => None,
        };
        match code {
            Some(code) => Ok(WebhookResponse {
                code,
                reason: String::new(),
                message: String::new(),
            }),
            None => Err(WebhookError::Connect("connection refused".into())),
        }
    }
}

// ── Builders ─────────────────────────────────────────────────────

pub fn step(replicas: IntOrPercent) -> Step {
    Step {
        traffic: TrafficStrategy::default(),
        targets: vec![StepTarget::new(CrossClusterObjectRef::new("c1", "web"), replicas)],
        breakpoint: false,
        properties: BTreeMap::new(),
    }
}

pub fn webhook(name: &str, policy: FailurePolicy) -> RolloutWebhook {
    RolloutWebhook {
        name: name.to_string(),
        failure_threshold: 1,
        failure_policy: policy,
        hook_types: vec![HookType::PreBatchStepHook, HookType::PostBatchStepHook],
        client_config: WebhookClientConfig {
            url: format!("http://hooks/{name}"),
            timeout_seconds: 60,
            period_seconds: 10,
        },
        properties: BTreeMap::new(),
    }
}

pub fn run_with(batches: Vec<Step>, webhooks: Vec<RolloutWebhook>) -> Run {
    Run {
        metadata: RunMeta {
            namespace: "default".into(),
            name: "run-1".into(),
            uid: "uid-1".into(),
            generation: 1,
            resource_version: 0,
            created_at: 0,
        },
        spec: RunSpec {
            target_type: ObjectTypeRef::new("apps/v1", "Deployment"),
            strategy: None,
            batches,
            toleration: Toleration::default(),
            webhooks,
        },
        control: RunControl::default(),
        status: RunStatus::default(),
    }
}
