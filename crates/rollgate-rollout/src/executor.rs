//! Batch executor — the per-run state machine.
//!
//! `reconcile` is level-triggered: it reads the run's persisted status,
//! advances it as far as it can without waiting, and reports when it wants
//! to be called again. A pass issues at most one side effect: right after a
//! batch is applied, or a hook passes on fresh webhook calls, it stops with
//! [`ReconcileOutcome::Checkpoint`] so the status recording it is persisted
//! before anything builds on it. Calling it twice in the same situation
//! therefore issues no duplicate webhook calls or target mutations.
//!
//! Per batch the sub-states run
//! `Initializing → PreBatchStepHook → Running → PostBatchStepHook`, then
//! either the next batch, a breakpoint (`Paused`) or the end of the run.

use std::time::Duration;

use tracing::{debug, info, warn};

use rollgate_core::{
    BatchRecord, BatchStatus, ConditionStatus, ConditionType, CrossClusterObjectRef, HookType,
    Run, RunPhase, RunStatus, Step, StepState, Timestamp,
};
use rollgate_webhook::{GateOutcome, ReviewContext, RunIdentity, WebhookGate};

use crate::error::{RolloutError, RolloutResult};
use crate::status::{fold_targets, mark_degraded, set_condition, step_complete, step_workloads};
use crate::target::{ApplyContext, WorkloadRegistry};
use crate::toleration::{self, Verdict};

/// What the caller should do after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do until something external changes.
    Done,
    /// Reconcile again after the given delay.
    RequeueAfter(Duration),
    /// A side effect was just recorded. Persist the status, then reconcile
    /// again right away.
    Checkpoint,
}

/// Drives runs through their compiled batches.
pub struct BatchExecutor {
    registry: WorkloadRegistry,
    gate: WebhookGate,
    poll_interval: Duration,
}

impl BatchExecutor {
    pub fn new(registry: WorkloadRegistry, gate: WebhookGate, poll_interval: Duration) -> Self {
        Self {
            registry,
            gate,
            poll_interval,
        }
    }

    /// Advance `run` as far as possible at time `now`.
    ///
    /// Errors are transient: the status keeps whatever progress was made
    /// and the phase is left alone.
    pub async fn reconcile(&self, run: &mut Run, now: Timestamp) -> RolloutResult<ReconcileOutcome> {
        if run.is_terminal() {
            return Ok(ReconcileOutcome::Done);
        }

        let before = run.status.clone();
        let result = self.drive(run, now).await;
        if run.status != before {
            run.status.last_update_time = Some(now);
        }
        result
    }

    async fn drive(&self, run: &mut Run, now: Timestamp) -> RolloutResult<ReconcileOutcome> {
        let key = run.table_key();
        run.status.observed_generation = run.metadata.generation;

        if run.spec.batches.is_empty() {
            return Err(RolloutError::InvalidPlan(format!("run {key} has no batches")));
        }

        if run.status.batch_status.is_none() {
            if run.control.canceled {
                cancel(run, now);
                return Ok(ReconcileOutcome::Done);
            }
            run.status.batch_status = Some(BatchStatus::default());
            start_batch(&mut run.status, 0, now);
            run.status.phase = RunPhase::Progressing;
            set_condition(
                &mut run.status,
                ConditionType::Progressing,
                ConditionStatus::True,
                "RunStarted",
                format!("{} batches", run.spec.batches.len()),
                now,
            );
            info!(run = %key, batches = run.spec.batches.len(), "run started");
        }

        loop {
            if run.control.canceled {
                cancel(run, now);
                return Ok(ReconcileOutcome::Done);
            }

            let (index, state) = cursor(&mut run.status);

            if run.control.paused {
                if state != StepState::Paused && run.status.phase != RunPhase::Paused {
                    run.status.phase = RunPhase::Paused;
                    set_condition(
                        &mut run.status,
                        ConditionType::Paused,
                        ConditionStatus::True,
                        "PausedByOperator",
                        format!("held at batch {index} in {state:?}"),
                        now,
                    );
                    info!(run = %key, batch = index, ?state, "run held by operator");
                }
                return Ok(ReconcileOutcome::Done);
            }
            if run.status.phase == RunPhase::Paused && state != StepState::Paused {
                run.status.phase = RunPhase::Progressing;
                set_condition(
                    &mut run.status,
                    ConditionType::Paused,
                    ConditionStatus::False,
                    "Resumed",
                    "",
                    now,
                );
                info!(run = %key, batch = index, "run released by operator");
            }

            let step = run
                .spec
                .batches
                .get(index as usize)
                .cloned()
                .ok_or_else(|| RolloutError::InvalidPlan(format!("batch {index} out of range")))?;

            match state {
                StepState::Pending | StepState::Initializing => {
                    let accessor = self.registry.get(&run.spec.target_type)?;
                    let observed = accessor
                        .status(&run.metadata.namespace, &target_refs(&step))
                        .await?;
                    fold_targets(&mut run.status, &step, &observed, now);
                    transition(&mut run.status, StepState::PreBatchStepHook);
                    debug!(run = %key, batch = index, "targets resolved");
                }

                StepState::PreBatchStepHook | StepState::PostBatchStepHook => {
                    let hook = match state {
                        StepState::PreBatchStepHook => HookType::PreBatchStepHook,
                        _ => HookType::PostBatchStepHook,
                    };
                    let (outcome, called) = self.run_gate(run, hook, index, &step, now).await;
                    match outcome {
                        GateOutcome::Pending { requeue_after } => {
                            return Ok(ReconcileOutcome::RequeueAfter(requeue_after));
                        }
                        GateOutcome::Passed { ignored } => {
                            for name in ignored {
                                set_condition(
                                    &mut run.status,
                                    ConditionType::WebhookIgnored,
                                    ConditionStatus::True,
                                    "WebhookFailureIgnored",
                                    format!("webhook {name} failed at {hook} of batch {index}"),
                                    now,
                                );
                            }
                            if hook == HookType::PreBatchStepHook {
                                transition(&mut run.status, StepState::Running);
                            } else if let Some(outcome) = complete_batch(run, index, &step, now) {
                                return Ok(outcome);
                            }
                            if called {
                                return Ok(ReconcileOutcome::Checkpoint);
                            }
                        }
                        GateOutcome::Failed { failed } => {
                            let record = record_mut(&mut run.status, index, now);
                            let reason = failed
                                .first()
                                .and_then(|name| record.webhook(hook, name))
                                .map(|w| w.reason.clone())
                                .unwrap_or_else(|| "WebhookFailed".to_string());
                            fail(
                                run,
                                now,
                                &reason,
                                format!(
                                    "webhook {} failed at {hook} of batch {index}",
                                    failed.join(", ")
                                ),
                            );
                            return Ok(ReconcileOutcome::Done);
                        }
                    }
                }

                StepState::Running => {
                    if let Some(outcome) = self.run_batch(run, index, &step, now).await? {
                        return Ok(outcome);
                    }
                    transition(&mut run.status, StepState::PostBatchStepHook);
                }

                StepState::Paused => {
                    let resume = run.control.resume;
                    let bs = run.status.batch_status.get_or_insert_with(BatchStatus::default);
                    if resume <= bs.observed_resume {
                        if run.status.phase != RunPhase::Paused {
                            run.status.phase = RunPhase::Paused;
                        }
                        return Ok(ReconcileOutcome::Done);
                    }
                    bs.observed_resume = resume;
                    run.status.phase = RunPhase::Progressing;
                    set_condition(
                        &mut run.status,
                        ConditionType::Paused,
                        ConditionStatus::False,
                        "Resumed",
                        format!("released after batch {index}"),
                        now,
                    );
                    info!(run = %key, batch = index, "breakpoint released");
                    start_batch(&mut run.status, index + 1, now);
                }

                StepState::Succeeded | StepState::Failed | StepState::Canceled => {
                    return Ok(ReconcileOutcome::Done);
                }
            }
        }
    }

    /// Evaluate the webhooks of `hook`. The flag is set when the pass
    /// changed any webhook record.
    async fn run_gate(
        &self,
        run: &mut Run,
        hook: HookType,
        index: u32,
        step: &Step,
        now: Timestamp,
    ) -> (GateOutcome, bool) {
        let identity = RunIdentity {
            namespace: run.metadata.namespace.clone(),
            name: run.metadata.name.clone(),
            uid: run.metadata.uid.clone(),
        };
        let ctx = ReviewContext {
            run: &identity,
            batch_index: index,
            batch_count: run.spec.batches.len() as u32,
            step,
        };
        let record = record_mut(&mut run.status, index, now);
        let before = record.webhooks.clone();
        let outcome = self
            .gate
            .evaluate(&run.spec.webhooks, hook, record, ctx, now)
            .await;
        (outcome, record.webhooks != before)
    }

    /// Apply the batch once, then watch it. Returns `Some` while the run
    /// has to wait, has failed or needs the apply checkpointed, `None` once
    /// the batch is complete.
    async fn run_batch(
        &self,
        run: &mut Run,
        index: u32,
        step: &Step,
        now: Timestamp,
    ) -> RolloutResult<Option<ReconcileOutcome>> {
        let key = run.table_key();
        let accessor = self.registry.get(&run.spec.target_type)?;

        let applied_at = match record_mut(&mut run.status, index, now).applied_at {
            Some(at) => at,
            None => {
                let ctx = ApplyContext {
                    namespace: &run.metadata.namespace,
                    run: &key,
                    batch_index: index,
                    traffic: &step.traffic,
                };
                accessor.apply(&ctx, &step.targets).await?;

                let record = record_mut(&mut run.status, index, now);
                record.applied_at = Some(now);
                record.traffic = (!step.traffic.is_empty()).then(|| step.traffic.clone());
                info!(
                    run = %key,
                    batch = index,
                    targets = step.targets.len(),
                    weight = ?step.traffic.weight,
                    "batch applied"
                );
                return Ok(Some(ReconcileOutcome::Checkpoint));
            }
        };

        let observed = accessor
            .status(&run.metadata.namespace, &target_refs(step))
            .await?;
        fold_targets(&mut run.status, step, &observed, now);
        let workloads = step_workloads(&run.status, step);

        match toleration::evaluate(&workloads, applied_at, now, &run.spec.toleration) {
            Verdict::Abort { failed, tolerated } => {
                let err = RolloutError::ToleranceExceeded(format!(
                    "batch {index}: {failed} failed replicas, {tolerated} tolerated"
                ));
                fail(run, now, err.reason(), err.to_string());
                return Ok(Some(ReconcileOutcome::Done));
            }
            Verdict::Degraded(names) => {
                mark_degraded(&mut run.status, &names);
                set_condition(
                    &mut run.status,
                    ConditionType::WorkloadDegraded,
                    ConditionStatus::True,
                    "WorkloadFailureThresholdExceeded",
                    names.join(", "),
                    now,
                );
                warn!(run = %key, batch = index, workloads = ?names, "workloads degraded");
            }
            Verdict::Continue => {}
        }

        let count_failed = toleration::failures_counted(&run.spec.toleration, applied_at, now);
        if !step_complete(&workloads, count_failed) {
            debug!(run = %key, batch = index, "waiting for targets");
            return Ok(Some(ReconcileOutcome::RequeueAfter(self.poll_interval)));
        }

        debug!(run = %key, batch = index, "batch targets ready");
        Ok(None)
    }
}

// ── Status transitions ───────────────────────────────────────────

fn cursor(status: &mut RunStatus) -> (u32, StepState) {
    let bs = status.batch_status.get_or_insert_with(BatchStatus::default);
    (bs.current_batch, bs.state)
}

fn target_refs(step: &Step) -> Vec<CrossClusterObjectRef> {
    step.targets.iter().map(|t| t.object.clone()).collect()
}

/// The record for batch `index`, created on first use.
fn record_mut(status: &mut RunStatus, index: u32, now: Timestamp) -> &mut BatchRecord {
    let bs = status.batch_status.get_or_insert_with(BatchStatus::default);
    let pos = match bs.records.iter().position(|r| r.index == index) {
        Some(pos) => pos,
        None => {
            bs.records.push(BatchRecord {
                index,
                state: StepState::Initializing,
                started_at: Some(now),
                ..Default::default()
            });
            bs.records.len() - 1
        }
    };
    &mut bs.records[pos]
}

fn start_batch(status: &mut RunStatus, index: u32, now: Timestamp) {
    let bs = status.batch_status.get_or_insert_with(BatchStatus::default);
    bs.current_batch = index;
    bs.state = StepState::Initializing;
    record_mut(status, index, now).state = StepState::Initializing;
    debug!(batch = index, "batch started");
}

/// Move the current batch to `state`, mirroring it on the batch record.
fn transition(status: &mut RunStatus, state: StepState) {
    let bs = status.batch_status.get_or_insert_with(BatchStatus::default);
    bs.state = state;
    let index = bs.current_batch;
    if let Some(record) = bs.record_mut(index) {
        record.state = state;
    }
}

/// Wrap up a batch whose post-batch hook passed. Returns `None` if the
/// next batch should start right away.
fn complete_batch(run: &mut Run, index: u32, step: &Step, now: Timestamp) -> Option<ReconcileOutcome> {
    let key = run.table_key();
    let record = record_mut(&mut run.status, index, now);
    record.state = StepState::Succeeded;
    record.finished_at = Some(now);
    info!(run = %key, batch = index, "batch succeeded");

    let last = index as usize + 1 >= run.spec.batches.len();
    if last {
        transition(&mut run.status, StepState::Succeeded);
        run.status.phase = RunPhase::Succeeded;
        set_condition(
            &mut run.status,
            ConditionType::Progressing,
            ConditionStatus::False,
            "RunSucceeded",
            "",
            now,
        );
        set_condition(
            &mut run.status,
            ConditionType::Completed,
            ConditionStatus::True,
            "Succeeded",
            format!("{} batches completed", run.spec.batches.len()),
            now,
        );
        info!(run = %key, "run succeeded");
        return Some(ReconcileOutcome::Done);
    }

    if step.breakpoint {
        let resume = run.control.resume;
        let bs = run.status.batch_status.get_or_insert_with(BatchStatus::default);
        bs.state = StepState::Paused;
        bs.observed_resume = resume;
        run.status.phase = RunPhase::Paused;
        set_condition(
            &mut run.status,
            ConditionType::Paused,
            ConditionStatus::True,
            "Breakpoint",
            format!("paused after batch {index}"),
            now,
        );
        info!(run = %key, batch = index, "paused at breakpoint");
        return Some(ReconcileOutcome::Done);
    }

    start_batch(&mut run.status, index + 1, now);
    None
}

fn fail(run: &mut Run, now: Timestamp, reason: &str, message: String) {
    let bs = run.status.batch_status.get_or_insert_with(BatchStatus::default);
    let index = bs.current_batch;
    bs.state = StepState::Failed;
    if let Some(record) = bs.record_mut(index) {
        record.state = StepState::Failed;
        record.finished_at = Some(now);
    }
    run.status.phase = RunPhase::Failed;
    set_condition(
        &mut run.status,
        ConditionType::Progressing,
        ConditionStatus::False,
        reason,
        message.clone(),
        now,
    );
    set_condition(
        &mut run.status,
        ConditionType::Completed,
        ConditionStatus::True,
        reason,
        message.clone(),
        now,
    );
    warn!(run = %run.table_key(), batch = index, %reason, %message, "run failed");
}

fn cancel(run: &mut Run, now: Timestamp) {
    if let Some(bs) = run.status.batch_status.as_mut() {
        let index = bs.current_batch;
        bs.state = StepState::Canceled;
        if let Some(record) = bs.record_mut(index).filter(|r| !r.state.is_terminal()) {
            record.state = StepState::Canceled;
            record.finished_at = Some(now);
        }
    }
    run.status.phase = RunPhase::Canceled;
    set_condition(
        &mut run.status,
        ConditionType::Completed,
        ConditionStatus::True,
        "Canceled",
        "canceled by operator",
        now,
    );
    info!(run = %run.table_key(), "run canceled");
}
