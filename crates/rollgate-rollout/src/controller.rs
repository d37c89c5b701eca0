//! Run controller — the reconcile loop around the batch executor.
//!
//! Every active run is reconciled when it comes due: at its requested
//! requeue time, after a backoff following an error, at the resync
//! interval, or as soon as the controller is poked. Runs are reconciled
//! concurrently, each in its own task, and written back with optimistic
//! concurrency. A write conflict usually means a control request changed
//! the run; the computed status is then written onto the fresh copy and the
//! control change is seen by the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rollgate_core::config::ControllerConfig;
use rollgate_core::{ConditionStatus, ConditionType, Run, RunStatus, epoch_secs};
use rollgate_state::{StateError, StateStore};

use crate::error::{RolloutError, RolloutResult};
use crate::executor::{BatchExecutor, ReconcileOutcome};
use crate::status::{latest_condition, set_condition};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Checkpoints followed by one `reconcile_key` call before it yields.
const MAX_CHECKPOINTS: usize = 64;

/// Delay before retrying a run that failed `failures` times in a row.
pub fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    MIN_BACKOFF.saturating_mul(1 << exp).min(MAX_BACKOFF)
}

/// Cheap handle for asking the controller to look at runs now.
#[derive(Clone)]
pub struct ControllerHandle {
    trigger: Arc<Notify>,
}

impl ControllerHandle {
    pub fn poke(&self) {
        self.trigger.notify_one();
    }
}

pub struct RunController {
    store: StateStore,
    executor: Arc<BatchExecutor>,
    config: ControllerConfig,
    trigger: Arc<Notify>,
}

impl RunController {
    pub fn new(store: StateStore, executor: BatchExecutor, config: ControllerConfig) -> Self {
        Self {
            store,
            executor: Arc::new(executor),
            config,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            trigger: self.trigger.clone(),
        }
    }

    /// Reconcile one run and persist the result, following checkpoints
    /// until the run has to wait.
    ///
    /// Executor errors are recorded as a `Ready=False` condition and then
    /// returned; the run's phase is not touched.
    pub async fn reconcile_key(&self, key: &str) -> RolloutResult<ReconcileOutcome> {
        for _ in 0..MAX_CHECKPOINTS {
            match self.reconcile_once(key).await? {
                ReconcileOutcome::Checkpoint => continue,
                outcome => return Ok(outcome),
            }
        }
        Ok(ReconcileOutcome::RequeueAfter(Duration::ZERO))
    }

    async fn reconcile_once(&self, key: &str) -> RolloutResult<ReconcileOutcome> {
        let attempts = self.config.conflict_retries.max(1);

        for attempt in 1..=attempts {
            let Some(mut run) = self.store.get_run(key)? else {
                debug!(run = %key, "run gone");
                return Ok(ReconcileOutcome::Done);
            };
            if run.is_terminal() {
                return Ok(ReconcileOutcome::Done);
            }

            let before = run.status.clone();
            let now = epoch_secs();
            let result = self.executor.reconcile(&mut run, now).await;

            match &result {
                Ok(_) => {
                    let was_failing = latest_condition(&run.status, ConditionType::Ready)
                        .is_some_and(|c| c.status == ConditionStatus::False);
                    if was_failing {
                        set_condition(
                            &mut run.status,
                            ConditionType::Ready,
                            ConditionStatus::True,
                            "Reconciled",
                            "",
                            now,
                        );
                    }
                }
                Err(e) => {
                    set_condition(
                        &mut run.status,
                        ConditionType::Ready,
                        ConditionStatus::False,
                        e.reason(),
                        e.to_string(),
                        now,
                    );
                }
            }

            if run.status == before {
                return result;
            }
            run.status.last_update_time = Some(now);

            if self.write_status(key, run, &before)? {
                return result;
            }
            debug!(run = %key, attempt, "status moved underneath, reconciling again");
        }

        Err(RolloutError::Conflict {
            key: key.to_string(),
            attempts,
        })
    }

    /// Persist a freshly computed status.
    ///
    /// Control requests and other writers that leave the status alone only
    /// bump the resource version, so on a conflict the status is moved onto
    /// the stored copy and written again. The status may record side effects
    /// that already happened and must not be lost. Returns false when the
    /// stored status itself changed since `read`.
    fn write_status(&self, key: &str, mut run: Run, read: &RunStatus) -> RolloutResult<bool> {
        let attempts = self.config.conflict_retries.max(1);

        for attempt in 1..=attempts {
            match self.store.update_run(&mut run) {
                Ok(()) => return Ok(true),
                Err(StateError::NotFound(_)) => {
                    debug!(run = %key, "run deleted during reconcile");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }

            let Some(mut stored) = self.store.get_run(key)? else {
                return Ok(true);
            };
            if stored.status != *read {
                return Ok(false);
            }
            debug!(run = %key, attempt, "run changed during reconcile, keeping computed status");
            stored.status = run.status;
            run = stored;
        }

        Err(RolloutError::Conflict {
            key: key.to_string(),
            attempts,
        })
    }

    /// Reconcile runs until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut due: HashMap<String, Instant> = HashMap::new();
        let mut failures: HashMap<String, u32> = HashMap::new();
        info!(
            resync_secs = self.config.resync_interval_secs,
            workers = self.config.max_concurrent_reconciles,
            "run controller started"
        );

        loop {
            let next = self.pass(&mut due, &mut failures).await;

            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = self.trigger.notified() => {
                    debug!("controller poked");
                    due.clear();
                }
                _ = shutdown.changed() => {
                    info!("run controller shutting down");
                    break;
                }
            }
        }
    }

    /// Reconcile every due run once. Returns when the next run comes due.
    async fn pass(
        self: &Arc<Self>,
        due: &mut HashMap<String, Instant>,
        failures: &mut HashMap<String, u32>,
    ) -> Instant {
        let resync = Duration::from_secs(self.config.resync_interval_secs.max(1));
        let started = Instant::now();

        let runs = match self.store.list_active_runs() {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "failed to list active runs");
                return started + MIN_BACKOFF;
            }
        };

        let active: HashSet<String> = runs.iter().map(|r| r.table_key()).collect();
        due.retain(|key, _| active.contains(key));
        failures.retain(|key, _| active.contains(key));

        let ready: Vec<String> = active
            .into_iter()
            .filter(|key| due.get(key).is_none_or(|at| *at <= started))
            .collect();

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        let mut tasks = JoinSet::new();
        for key in ready {
            let this = Arc::clone(self);
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = this.reconcile_key(&key).await;
                (key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "reconcile task panicked");
                    continue;
                }
            };
            let delay = match result {
                Ok(ReconcileOutcome::Done) => {
                    failures.remove(&key);
                    resync
                }
                Ok(ReconcileOutcome::RequeueAfter(after)) => {
                    failures.remove(&key);
                    after.min(resync)
                }
                Ok(ReconcileOutcome::Checkpoint) => {
                    failures.remove(&key);
                    Duration::ZERO
                }
                Err(e) => {
                    let count = failures.entry(key.clone()).or_default();
                    *count += 1;
                    let delay = backoff(*count);
                    warn!(run = %key, error = %e, retry_in = ?delay, "reconcile failed");
                    delay
                }
            };
            due.insert(key, Instant::now() + delay);
        }

        let fallback = Instant::now() + resync;
        due.values().copied().min().map_or(fallback, |at| at.min(fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use rollgate_core::{
        CrossClusterObjectRef, FailurePolicy, HookType, IntOrPercent, RolloutWebhook, RunPhase,
        Step, StepState, StepTarget, WebhookState,
    };
    use rollgate_webhook::{ResponseCode, WebhookGate};

    use crate::target::{ApplyContext, TargetStatus, WorkloadAccessor, WorkloadRegistry};
    use crate::testing::{FakeWorkloads, ScriptedWebhooks, run_with, step, webhook};

    fn controller(store: &StateStore, accessor: Arc<dyn WorkloadAccessor>) -> RunController {
        controller_with_hooks(store, accessor, Arc::new(ScriptedWebhooks::default()))
    }

    fn controller_with_hooks(
        store: &StateStore,
        accessor: Arc<dyn WorkloadAccessor>,
        hooks: Arc<ScriptedWebhooks>,
    ) -> RunController {
        let executor = BatchExecutor::new(
            WorkloadRegistry::new().with_fallback(accessor),
            WebhookGate::new(hooks),
            Duration::from_millis(10),
        );
        RunController::new(store.clone(), executor, ControllerConfig::default())
    }

    fn stored_run(store: &StateStore, steps: Vec<Step>) -> Run {
        stored_run_with(store, steps, vec![])
    }

    fn stored_run_with(store: &StateStore, steps: Vec<Step>, hooks: Vec<RolloutWebhook>) -> Run {
        let mut run = run_with(steps, hooks);
        store.create_run(&mut run).unwrap();
        run
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(7), Duration::from_secs(60));
        assert_eq!(backoff(100), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn reconcile_persists_progress() {
        let store = StateStore::open_in_memory().unwrap();
        let run = stored_run(&store, vec![step(IntOrPercent::FULL)]);
        let ctl = controller(&store, Arc::new(FakeWorkloads::with_replicas(3)));

        let out = ctl.reconcile_key(&run.table_key()).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Done);

        let stored = store.get_run(&run.table_key()).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Succeeded);
        // One write for the apply checkpoint, one for the finish.
        assert_eq!(stored.metadata.resource_version, 3);
        assert!(stored.status.last_update_time.is_some());
    }

    #[tokio::test]
    async fn errors_become_ready_condition() {
        let store = StateStore::open_in_memory().unwrap();
        let run = stored_run(&store, vec![step(IntOrPercent::FULL)]);
        let workloads = Arc::new(FakeWorkloads::with_replicas(3));
        workloads.set_unreachable(true);
        let ctl = controller(&store, workloads.clone());

        let err = ctl.reconcile_key(&run.table_key()).await.unwrap_err();
        assert!(matches!(err, RolloutError::TargetUnreachable { .. }));

        let stored = store.get_run(&run.table_key()).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Progressing);
        let ready = latest_condition(&stored.status, ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "TargetUnreachable");

        workloads.set_unreachable(false);
        ctl.reconcile_key(&run.table_key()).await.unwrap();
        let stored = store.get_run(&run.table_key()).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Succeeded);
        let ready = latest_condition(&stored.status, ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    /// Pauses the run through the store the first time the chosen call is
    /// made, as a concurrent control request would.
    struct PausingWorkloads {
        store: StateStore,
        key: String,
        inner: Arc<FakeWorkloads>,
        on_apply: bool,
        fired: AtomicBool,
    }

    impl PausingWorkloads {
        fn new(store: &StateStore, run: &Run, inner: &Arc<FakeWorkloads>, on_apply: bool) -> Self {
            Self {
                store: store.clone(),
                key: run.table_key(),
                inner: inner.clone(),
                on_apply,
                fired: AtomicBool::new(false),
            }
        }

        fn pause_once(&self) -> RolloutResult<()> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.store.update_run_control(&self.key, |c| c.paused = true)?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkloadAccessor for PausingWorkloads {
        async fn apply(&self, ctx: &ApplyContext<'_>, targets: &[StepTarget]) -> RolloutResult<()> {
            if self.on_apply {
                self.pause_once()?;
            }
            self.inner.apply(ctx, targets).await
        }

        async fn status(
            &self,
            namespace: &str,
            targets: &[CrossClusterObjectRef],
        ) -> RolloutResult<Vec<TargetStatus>> {
            if !self.on_apply {
                self.pause_once()?;
            }
            self.inner.status(namespace, targets).await
        }
    }

    fn resume(store: &StateStore, key: &str) {
        store
            .update_run_control(key, |c| {
                c.paused = false;
                c.resume += 1;
            })
            .unwrap();
    }

    #[tokio::test]
    async fn conflicting_control_write_is_picked_up() {
        let store = StateStore::open_in_memory().unwrap();
        let run = stored_run(&store, vec![step(IntOrPercent::FULL)]);
        let workloads = Arc::new(FakeWorkloads::with_replicas(3));
        let accessor = Arc::new(PausingWorkloads::new(&store, &run, &workloads, false));
        let ctl = controller(&store, accessor);

        let out = ctl.reconcile_key(&run.table_key()).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Done);

        let stored = store.get_run(&run.table_key()).unwrap().unwrap();
        assert!(stored.control.paused);
        assert_eq!(stored.status.phase, RunPhase::Paused);
        assert_eq!(stored.status.observed_generation, stored.metadata.generation);
        // The apply made before the pause was seen is on record.
        let bs = stored.status.batch_status.as_ref().unwrap();
        assert!(bs.record(0).unwrap().applied_at.is_some());
        assert_eq!(workloads.apply_calls(), 1);
    }

    #[tokio::test]
    async fn apply_survives_conflicting_pause() {
        let store = StateStore::open_in_memory().unwrap();
        let run = stored_run(
            &store,
            vec![step(IntOrPercent::Percent(50)), step(IntOrPercent::FULL)],
        );
        let key = run.table_key();
        let workloads = Arc::new(FakeWorkloads::with_replicas(10));
        let accessor = Arc::new(PausingWorkloads::new(&store, &run, &workloads, true));
        let ctl = controller(&store, accessor);

        let out = ctl.reconcile_key(&key).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Done);

        // Held right after batch 0 was applied; batch 1 was never started.
        let stored = store.get_run(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Paused);
        let bs = stored.status.batch_status.as_ref().unwrap();
        assert_eq!((bs.current_batch, bs.state), (0, StepState::Running));
        assert!(bs.record(0).unwrap().applied_at.is_some());
        assert_eq!(workloads.updated("web"), 5);
        assert_eq!(workloads.apply_calls(), 1);

        resume(&store, &key);
        let out = ctl.reconcile_key(&key).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Done);
        let stored = store.get_run(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Succeeded);
        // Batch 0 is not applied a second time.
        assert_eq!(workloads.apply_calls(), 2);
        assert_eq!(workloads.updated("web"), 10);
    }

    #[tokio::test]
    async fn webhook_call_survives_conflicting_pause() {
        let store = StateStore::open_in_memory().unwrap();
        let mut gate = webhook("gate", FailurePolicy::Fail);
        gate.hook_types = vec![HookType::PreBatchStepHook];
        let run = stored_run_with(&store, vec![step(IntOrPercent::FULL)], vec![gate]);
        let key = run.table_key();
        let workloads = Arc::new(FakeWorkloads::with_replicas(3));
        let accessor = Arc::new(PausingWorkloads::new(&store, &run, &workloads, false));
        let hooks = Arc::new(ScriptedWebhooks::default());
        hooks.always("gate", ResponseCode::Ok);
        let ctl = controller_with_hooks(&store, accessor, hooks.clone());

        ctl.reconcile_key(&key).await.unwrap();
        let stored = store.get_run(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Paused);
        assert_eq!(hooks.calls("gate"), 1);
        let record = stored.status.batch_status.as_ref().unwrap().record(0).unwrap();
        let call = record.webhook(HookType::PreBatchStepHook, "gate").unwrap();
        assert_eq!(call.state, WebhookState::Succeeded);
        assert_eq!(workloads.apply_calls(), 0);

        resume(&store, &key);
        ctl.reconcile_key(&key).await.unwrap();
        let stored = store.get_run(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Succeeded);
        assert_eq!(hooks.calls("gate"), 1);
    }

    #[tokio::test]
    async fn stale_status_is_not_written_over() {
        let store = StateStore::open_in_memory().unwrap();
        let run = stored_run(&store, vec![step(IntOrPercent::FULL)]);
        let key = run.table_key();
        let ctl = controller(&store, Arc::new(FakeWorkloads::with_replicas(3)));

        // Another writer already moved the status on.
        let mut theirs = store.get_run(&key).unwrap().unwrap();
        theirs.status.phase = RunPhase::Progressing;
        store.update_run(&mut theirs).unwrap();

        let mut ours = run.clone();
        ours.status.phase = RunPhase::Failed;
        assert!(!ctl.write_status(&key, ours, &run.status).unwrap());
        let stored = store.get_run(&key).unwrap().unwrap();
        assert_eq!(stored.status.phase, RunPhase::Progressing);
    }

    #[tokio::test]
    async fn loop_drives_runs_to_completion() {
        let store = StateStore::open_in_memory().unwrap();
        let first = stored_run(&store, vec![step(IntOrPercent::Int(1)), step(IntOrPercent::FULL)]);
        let ctl = Arc::new(controller(&store, Arc::new(FakeWorkloads::with_replicas(3))));
        let handle = ctl.handle();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ctl.clone().run(shutdown_rx));

        let mut second = run_with(vec![step(IntOrPercent::FULL)], vec![]);
        second.metadata.name = "run-2".into();
        store.create_run(&mut second).unwrap();
        handle.poke();

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let phases: Vec<RunPhase> = [&first, &second]
                    .iter()
                    .map(|r| store.get_run(&r.table_key()).unwrap().unwrap().status.phase)
                    .collect();
                if phases.iter().all(|p| *p == RunPhase::Succeeded) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(done.is_ok(), "runs did not complete");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
