//! Plan compiler — turns a batch strategy into the canonical step list.
//!
//! Both the explicit and the fast-batch form compile to the same `Vec<Step>`
//! where every step names its targets explicitly. All validation happens
//! here so that a run, once created, never carries an invalid plan.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use rollgate_core::{
    BatchStrategy, FastBatch, FastShare, HeaderMatchType, IntOrPercent, ObjectTypeRef, PauseMode,
    RolloutStrategy, RolloutWebhook, RunSpec, Step, StepTarget, StrategyStep, Toleration,
    TrafficStrategy, WorkloadRef,
};

use crate::error::{RolloutError, RolloutResult};

/// Compile `batch` against the candidate workloads.
pub fn compile(batch: &BatchStrategy, candidates: &[WorkloadRef]) -> RolloutResult<Vec<Step>> {
    check_form(batch)?;
    let steps = match &batch.fast_batch {
        Some(fast) => compile_fast(fast, candidates)?,
        None => batch
            .batches
            .iter()
            .enumerate()
            .map(|(i, step)| compile_step(i, step, candidates))
            .collect::<RolloutResult<Vec<_>>>()?,
    };

    for (i, step) in steps.iter().enumerate() {
        validate_step(i, step)?;
    }
    if let Some(toleration) = &batch.toleration {
        validate_toleration(toleration)?;
    }

    debug!(
        steps = steps.len(),
        breakpoints = steps.iter().filter(|s| s.breakpoint).count(),
        "plan compiled"
    );
    Ok(steps)
}

/// Check a reusable strategy on its own. Targets are only resolved when a
/// run is created from it.
pub fn validate_strategy(strategy: &RolloutStrategy) -> RolloutResult<()> {
    if strategy.namespace.is_empty() || strategy.name.is_empty() {
        return Err(RolloutError::invalid("strategy namespace and name are required"));
    }
    validate_webhooks(&strategy.webhooks)?;

    let batch = &strategy.batch;
    check_form(batch)?;
    if let Some(fast) = &batch.fast_batch {
        compile_fast(fast, &[])?;
        if let Some(beta) = &fast.beta {
            validate_traffic(0, &beta.traffic)?;
        }
    }
    for (i, step) in batch.batches.iter().enumerate() {
        if let Some(selector) = &step.matches {
            selector
                .validate()
                .map_err(|e| RolloutError::invalid(format!("batch {i}: {e}")))?;
        }
        if !step.replicas.is_valid() {
            return Err(RolloutError::invalid(format!(
                "batch {i}: replicas {} exceeds 100%",
                step.replicas
            )));
        }
        validate_traffic(i, &step.traffic)?;
    }
    if let Some(toleration) = &batch.toleration {
        validate_toleration(toleration)?;
    }
    Ok(())
}

/// Compile a complete run snapshot.
pub fn compile_run_spec(
    target_type: ObjectTypeRef,
    strategy: Option<String>,
    batch: &BatchStrategy,
    webhooks: &[RolloutWebhook],
    candidates: &[WorkloadRef],
) -> RolloutResult<RunSpec> {
    if target_type.kind.is_empty() {
        return Err(RolloutError::invalid("targetType.kind is required"));
    }
    validate_webhooks(webhooks)?;
    let batches = compile(batch, candidates)?;

    Ok(RunSpec {
        target_type,
        strategy,
        batches,
        toleration: batch.toleration.clone().unwrap_or_default(),
        webhooks: webhooks.to_vec(),
    })
}

fn compile_step(index: usize, step: &StrategyStep, candidates: &[WorkloadRef]) -> RolloutResult<Step> {
    let targets = if !step.targets.is_empty() {
        step.targets.clone()
    } else if let Some(selector) = &step.matches {
        selector
            .validate()
            .map_err(|e| RolloutError::invalid(format!("batch {index}: {e}")))?;
        candidates
            .iter()
            .filter(|c| selector.matches(&c.labels))
            .map(|c| StepTarget::new(c.object.clone(), step.replicas))
            .collect()
    } else {
        all_targets(candidates, step.replicas)
    };

    Ok(Step {
        traffic: step.traffic.clone(),
        targets,
        breakpoint: step.breakpoint,
        properties: step.properties.clone(),
    })
}

fn compile_fast(fast: &FastBatch, candidates: &[WorkloadRef]) -> RolloutResult<Vec<Step>> {
    if fast.count == 0 {
        return Err(RolloutError::invalid("fastBatch.count must be at least 1"));
    }
    if fast.count == 1 && fast.beta.is_some() {
        return Err(RolloutError::invalid(
            "fastBatch with a beta batch needs a count of at least 2",
        ));
    }
    if let Some(&bad) = fast.paused_batches.iter().find(|&&i| i >= fast.count) {
        return Err(RolloutError::invalid(format!(
            "pausedBatches index {bad} out of range for {} batches",
            fast.count
        )));
    }

    let mut breakpoints: BTreeSet<u32> = fast.paused_batches.iter().copied().collect();
    match fast.pause_mode {
        PauseMode::Never => {}
        PauseMode::FirstBatch => {
            breakpoints.insert(0);
        }
        PauseMode::EachBatch => breakpoints.extend(0..fast.count),
    }

    let mut steps = Vec::with_capacity(fast.count as usize);
    let beta = fast.beta.as_ref().map(|b| b.replicas);
    if let Some(b) = &fast.beta {
        if !b.replicas.is_valid() {
            return Err(RolloutError::invalid(format!(
                "fastBatch.beta: replicas {} exceeds 100%",
                b.replicas
            )));
        }
        steps.push(Step {
            traffic: b.traffic.clone(),
            targets: all_targets(candidates, b.replicas),
            breakpoint: false,
            properties: Default::default(),
        });
    }

    // Counts are only known per workload, so each batch keeps its position
    // and the split is done when it is applied.
    let of = fast.count - steps.len() as u32;
    for batch in 1..=of {
        let share = FastShare { beta, batch, of };
        let replicas = IntOrPercent::Percent((u64::from(batch) * 100 / u64::from(of)) as u32);
        steps.push(Step {
            traffic: TrafficStrategy::default(),
            targets: candidates
                .iter()
                .map(|c| StepTarget {
                    share: Some(share),
                    ..StepTarget::new(c.object.clone(), replicas)
                })
                .collect(),
            breakpoint: false,
            properties: Default::default(),
        });
    }

    for (i, step) in steps.iter_mut().enumerate() {
        step.breakpoint = breakpoints.contains(&(i as u32));
    }
    Ok(steps)
}

fn all_targets(candidates: &[WorkloadRef], replicas: IntOrPercent) -> Vec<StepTarget> {
    candidates
        .iter()
        .map(|c| StepTarget::new(c.object.clone(), replicas))
        .collect()
}

// ── Validation ───────────────────────────────────────────────────

fn check_form(batch: &BatchStrategy) -> RolloutResult<()> {
    match (&batch.fast_batch, batch.batches.is_empty()) {
        (Some(_), false) => Err(RolloutError::invalid(
            "fastBatch and batches are mutually exclusive",
        )),
        (None, true) => Err(RolloutError::invalid(
            "one of fastBatch or batches is required",
        )),
        _ => Ok(()),
    }
}

fn validate_step(index: usize, step: &Step) -> RolloutResult<()> {
    if step.targets.is_empty() {
        return Err(RolloutError::invalid(format!(
            "batch {index} resolves to no targets"
        )));
    }

    let mut seen = HashSet::new();
    for target in &step.targets {
        if !seen.insert(&target.object) {
            return Err(RolloutError::invalid(format!(
                "batch {index}: target {} listed twice",
                target.object
            )));
        }
        if !target.replicas.is_valid() {
            return Err(RolloutError::invalid(format!(
                "batch {index}: replicas {} exceeds 100%",
                target.replicas
            )));
        }
    }

    validate_traffic(index, &step.traffic)
}

fn validate_traffic(index: usize, traffic: &TrafficStrategy) -> RolloutResult<()> {
    if let Some(weight) = traffic.weight.filter(|w| *w > 100) {
        return Err(RolloutError::invalid(format!(
            "batch {index}: traffic weight {weight} exceeds 100"
        )));
    }

    let Some(http) = &traffic.http else {
        return Ok(());
    };
    for header in http.matches.iter().flat_map(|m| &m.headers) {
        if header.name.is_empty() {
            return Err(RolloutError::invalid(format!(
                "batch {index}: header match without a name"
            )));
        }
        if header.match_type == HeaderMatchType::RegularExpression {
            regex::Regex::new(&header.value).map_err(|e| {
                RolloutError::invalid(format!(
                    "batch {index}: header {} has an invalid pattern: {e}",
                    header.name
                ))
            })?;
        }
    }
    Ok(())
}

fn validate_toleration(toleration: &Toleration) -> RolloutResult<()> {
    for (field, value) in [
        ("workloadFailureThreshold", toleration.workload_failure_threshold),
        ("taskFailureThreshold", toleration.task_failure_threshold),
    ] {
        if !value.is_valid() {
            return Err(RolloutError::invalid(format!(
                "toleration.{field} {value} exceeds 100%"
            )));
        }
    }
    Ok(())
}

/// Check webhook definitions: unique names, hook points, plain-HTTP URLs.
pub fn validate_webhooks(webhooks: &[RolloutWebhook]) -> RolloutResult<()> {
    let mut names = HashSet::new();
    for webhook in webhooks {
        if webhook.name.is_empty() {
            return Err(RolloutError::invalid("webhook without a name"));
        }
        if !names.insert(webhook.name.as_str()) {
            return Err(RolloutError::invalid(format!(
                "duplicate webhook name {}",
                webhook.name
            )));
        }
        if webhook.hook_types.is_empty() {
            return Err(RolloutError::invalid(format!(
                "webhook {} has no hookTypes",
                webhook.name
            )));
        }
        if !webhook.client_config.url.starts_with("http://") {
            return Err(RolloutError::invalid(format!(
                "webhook {}: url must be an http:// URL",
                webhook.name
            )));
        }
        if webhook.client_config.timeout_seconds == 0 || webhook.client_config.period_seconds == 0
        {
            return Err(RolloutError::invalid(format!(
                "webhook {}: timeoutSeconds and periodSeconds must be positive",
                webhook.name
            )));
        }
    }
    Ok(())
}
