//! The webhook gate: polling, thresholds, deadlines and failure policy.
//!
//! Every decision is made against the persisted [`WebhookRecord`]s of the
//! current batch, never against in-memory counters.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use rollgate_core::{
    BatchRecord, FailurePolicy, HookType, RolloutWebhook, Step, Timestamp, WebhookRecord,
    WebhookState,
};

use crate::client::{
    ResponseCode, RunIdentity, TargetSummary, WebhookClient, WebhookResponse, WebhookReview,
};
use crate::error::WebhookResult;

pub const REASON_SUCCEEDED: &str = "WebhookSucceeded";
pub const REASON_PROCESSING: &str = "WebhookProcessing";
pub const REASON_REJECTED: &str = "WebhookRejected";
pub const REASON_TIMEOUT: &str = "WebhookTimeout";
pub const REASON_CALL_FAILED: &str = "WebhookCallFailed";

/// Result of one gate pass over a hook point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// At least one webhook is still undecided; evaluate again later.
    Pending { requeue_after: Duration },
    /// Every webhook succeeded, or failed under the Ignore policy.
    Passed { ignored: Vec<String> },
    /// At least one Fail-policy webhook failed.
    Failed { failed: Vec<String> },
}

/// What a webhook is told about the batch it gates.
#[derive(Debug, Clone, Copy)]
pub struct ReviewContext<'a> {
    pub run: &'a RunIdentity,
    pub batch_index: u32,
    pub batch_count: u32,
    pub step: &'a Step,
}

impl ReviewContext<'_> {
    fn review(&self, webhook: &RolloutWebhook, hook: HookType) -> WebhookReview {
        let mut properties = webhook.properties.clone();
        properties.extend(
            self.step
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        WebhookReview {
            run: self.run.clone(),
            hook_type: hook,
            batch_index: self.batch_index,
            batch_count: self.batch_count,
            properties,
            targets: self
                .step
                .targets
                .iter()
                .map(|t| TargetSummary {
                    cluster: t.object.cluster.clone(),
                    name: t.object.name.clone(),
                    replicas: t.replicas,
                })
                .collect(),
            traffic: self.step.traffic.clone(),
        }
    }
}

/// Evaluates the webhooks of one run.
#[derive(Clone)]
pub struct WebhookGate {
    client: Arc<dyn WebhookClient>,
}

impl WebhookGate {
    pub fn new(client: Arc<dyn WebhookClient>) -> Self {
        Self { client }
    }

    /// Run one pass over every webhook registered for `hook`.
    ///
    /// Each due webhook is called at most once. Outcomes are written into
    /// `record` before this returns. Webhooks that already finished are
    /// never called again.
    pub async fn evaluate(
        &self,
        webhooks: &[RolloutWebhook],
        hook: HookType,
        record: &mut BatchRecord,
        ctx: ReviewContext<'_>,
        now: Timestamp,
    ) -> GateOutcome {
        let mut next_due: Option<u64> = None;

        for webhook in webhooks.iter().filter(|w| w.participates_in(hook)) {
            let idx = match record
                .webhooks
                .iter()
                .position(|w| w.hook_type == hook && w.name == webhook.name)
            {
                Some(idx) => idx,
                None => {
                    record.webhooks.push(WebhookRecord::new(&webhook.name, hook));
                    record.webhooks.len() - 1
                }
            };

            if record.webhooks[idx].is_finished() {
                continue;
            }

            if check_deadline(&mut record.webhooks[idx], webhook, now) {
                continue;
            }

            let wait = seconds_until_due(&record.webhooks[idx], webhook, now);
            if wait > 0 {
                next_due = Some(next_due.map_or(wait, |d| d.min(wait)));
                continue;
            }

            let review = ctx.review(webhook, hook);
            let timeout = call_timeout(&record.webhooks[idx], webhook, now);
            debug!(
                webhook = %webhook.name,
                %hook,
                batch = ctx.batch_index,
                ?timeout,
                "calling webhook"
            );
            let result = self
                .client
                .call(&webhook.client_config.url, &review, timeout)
                .await;
            record_attempt(&mut record.webhooks[idx], webhook, result, now);

            if !record.webhooks[idx].is_finished() {
                let period = u64::from(webhook.client_config.period_seconds.max(1));
                next_due = Some(next_due.map_or(period, |d| d.min(period)));
            }
        }

        aggregate(webhooks, hook, record, next_due)
    }
}

/// Fold a single call result into the webhook's record.
pub fn record_attempt(
    rec: &mut WebhookRecord,
    webhook: &RolloutWebhook,
    result: WebhookResult<WebhookResponse>,
    now: Timestamp,
) {
    rec.first_attempt_at.get_or_insert(now);
    rec.last_attempt_at = Some(now);

    match result {
        Ok(resp) => {
            rec.code = Some(code_str(resp.code).to_string());
            rec.message = resp.message;
            match resp.code {
                ResponseCode::Ok => {
                    rec.state = WebhookState::Succeeded;
                    rec.reason = non_empty(resp.reason, REASON_SUCCEEDED);
                    info!(webhook = %rec.name, hook = %rec.hook_type, "webhook succeeded");
                    return;
                }
                ResponseCode::Processing => {
                    rec.reason = non_empty(resp.reason, REASON_PROCESSING);
                }
                ResponseCode::Error => {
                    rec.failure_count += 1;
                    rec.reason = non_empty(resp.reason, REASON_REJECTED);
                    warn!(
                        webhook = %rec.name,
                        failures = rec.failure_count,
                        message = %rec.message,
                        "webhook rejected"
                    );
                }
            }
        }
        Err(e) => {
            rec.failure_count += 1;
            rec.code = None;
            rec.reason = REASON_CALL_FAILED.to_string();
            rec.message = e.to_string();
            warn!(
                webhook = %rec.name,
                failures = rec.failure_count,
                error = %e,
                "webhook call failed"
            );
        }
    }

    if rec.failure_count >= webhook.effective_failure_threshold() {
        fail(rec, webhook, REASON_REJECTED);
    } else {
        check_deadline(rec, webhook, now);
    }
}

/// Fail the webhook once more time than its budget has passed since the
/// first attempt. Returns true if it did.
fn check_deadline(rec: &mut WebhookRecord, webhook: &RolloutWebhook, now: Timestamp) -> bool {
    let Some(first) = rec.first_attempt_at else {
        return false;
    };
    let budget = u64::from(webhook.client_config.timeout_seconds);
    if now.saturating_sub(first) <= budget {
        return false;
    }

    rec.failure_count += 1;
    rec.message = format!(
        "no decision within {budget}s (last: {})",
        if rec.message.is_empty() { "none" } else { &rec.message }
    );
    fail(rec, webhook, REASON_TIMEOUT);
    true
}

fn fail(rec: &mut WebhookRecord, webhook: &RolloutWebhook, reason: &str) {
    rec.state = WebhookState::Failed;
    rec.reason = reason.to_string();
    rec.ignored = webhook.failure_policy == FailurePolicy::Ignore;
    if rec.ignored {
        warn!(webhook = %rec.name, %reason, "webhook failed, ignored by policy");
    } else {
        warn!(webhook = %rec.name, %reason, "webhook failed");
    }
}

fn seconds_until_due(rec: &WebhookRecord, webhook: &RolloutWebhook, now: Timestamp) -> u64 {
    match rec.last_attempt_at {
        None => 0,
        Some(last) => {
            let due = last + u64::from(webhook.client_config.period_seconds.max(1));
            due.saturating_sub(now)
        }
    }
}

/// A single call may use whatever remains of the webhook's budget.
fn call_timeout(rec: &WebhookRecord, webhook: &RolloutWebhook, now: Timestamp) -> Duration {
    let budget = u64::from(webhook.client_config.timeout_seconds.max(1));
    let used = rec
        .first_attempt_at
        .map(|first| now.saturating_sub(first))
        .unwrap_or(0);
    Duration::from_secs(budget.saturating_sub(used).max(1))
}

fn aggregate(
    webhooks: &[RolloutWebhook],
    hook: HookType,
    record: &BatchRecord,
    next_due: Option<u64>,
) -> GateOutcome {
    let mut ignored = Vec::new();
    let mut failed = Vec::new();
    let mut pending = false;

    for webhook in webhooks.iter().filter(|w| w.participates_in(hook)) {
        match record.webhook(hook, &webhook.name) {
            Some(rec) if rec.state == WebhookState::Succeeded => {}
            Some(rec) if rec.state == WebhookState::Failed && rec.ignored => {
                ignored.push(rec.name.clone())
            }
            Some(rec) if rec.state == WebhookState::Failed => failed.push(rec.name.clone()),
            _ => pending = true,
        }
    }

    // Finish every webhook before deciding so each has a complete record.
    if pending {
        return GateOutcome::Pending {
            requeue_after: Duration::from_secs(next_due.unwrap_or(1).max(1)),
        };
    }
    if failed.is_empty() {
        GateOutcome::Passed { ignored }
    } else {
        GateOutcome::Failed { failed }
    }
}

fn code_str(code: ResponseCode) -> &'static str {
    match code {
        ResponseCode::Ok => "OK",
        ResponseCode::Processing => "Processing",
        ResponseCode::Error => "Error",
    }
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
