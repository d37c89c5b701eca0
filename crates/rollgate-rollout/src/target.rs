//! Target resolver — workload accessors and the registry that selects them.
//!
//! How a workload kind is actually scaled or updated is not this crate's
//! business. An accessor only has to record the desired updated replicas
//! and traffic for a target and report the counts it observes. Both
//! operations must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use rollgate_core::{CrossClusterObjectRef, ObjectTypeRef, StepTarget, TrafficStrategy, epoch_secs};
use rollgate_state::{StateError, StateStore, workload_key};

use crate::error::{RolloutError, RolloutResult};

/// Replica counts observed for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStatus {
    pub cluster: String,
    pub name: String,
    pub replicas: u32,
    pub updated_replicas: u32,
    pub updated_ready_replicas: u32,
    pub failed_replicas: u32,
}

/// Who is asking for a mutation, and for which batch.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub namespace: &'a str,
    /// `{namespace}/{name}` of the run.
    pub run: &'a str,
    pub batch_index: u32,
    pub traffic: &'a TrafficStrategy,
}

#[async_trait]
pub trait WorkloadAccessor: Send + Sync {
    /// Request the cumulative updated replicas of each target.
    async fn apply(&self, ctx: &ApplyContext<'_>, targets: &[StepTarget]) -> RolloutResult<()>;

    /// Observe the targets. Fails with `TargetNotFound` if any is missing.
    async fn status(
        &self,
        namespace: &str,
        targets: &[CrossClusterObjectRef],
    ) -> RolloutResult<Vec<TargetStatus>>;
}

/// Accessors keyed by target type.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    accessors: HashMap<ObjectTypeRef, Arc<dyn WorkloadAccessor>>,
    fallback: Option<Arc<dyn WorkloadAccessor>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target_type: ObjectTypeRef, accessor: Arc<dyn WorkloadAccessor>) {
        debug!(%target_type, "workload accessor registered");
        self.accessors.insert(target_type, accessor);
    }

    /// Accessor used for types without a dedicated registration.
    pub fn with_fallback(mut self, accessor: Arc<dyn WorkloadAccessor>) -> Self {
        self.fallback = Some(accessor);
        self
    }

    pub fn get(&self, target_type: &ObjectTypeRef) -> RolloutResult<Arc<dyn WorkloadAccessor>> {
        self.accessors
            .get(target_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| RolloutError::UnknownTargetType(target_type.to_string()))
    }
}

// ── Store-backed workloads ──────────────────────────────────────

/// Workloads registered in the state store, with counts reported by
/// external agents through the API.
#[derive(Clone)]
pub struct StoreWorkloads {
    store: StateStore,
}

impl StoreWorkloads {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WorkloadAccessor for StoreWorkloads {
    async fn apply(&self, ctx: &ApplyContext<'_>, targets: &[StepTarget]) -> RolloutResult<()> {
        let traffic = (!ctx.traffic.is_empty()).then(|| ctx.traffic.clone());
        for target in targets {
            let CrossClusterObjectRef { cluster, name } = &target.object;
            let result = self.store.update_workload(cluster, ctx.namespace, name, |w| {
                w.desired_updated_replicas = Some(target.desired_replicas(w.replicas));
                w.desired_traffic = traffic.clone();
                w.owner_run = Some(ctx.run.to_string());
                w.updated_at = epoch_secs();
            });
            match result {
                Ok(w) => {
                    debug!(
                        run = %ctx.run,
                        batch = ctx.batch_index,
                        workload = %w.table_key(),
                        desired = ?w.desired_updated_replicas,
                        "workload desired state recorded"
                    );
                }
                Err(StateError::NotFound(_)) => {
                    return Err(RolloutError::TargetNotFound(workload_key(
                        cluster,
                        ctx.namespace,
                        name,
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn status(
        &self,
        namespace: &str,
        targets: &[CrossClusterObjectRef],
    ) -> RolloutResult<Vec<TargetStatus>> {
        targets
            .iter()
            .map(|t| -> RolloutResult<TargetStatus> {
                let w = self
                    .store
                    .get_workload(&t.cluster, namespace, &t.name)?
                    .ok_or_else(|| {
                        RolloutError::TargetNotFound(workload_key(&t.cluster, namespace, &t.name))
                    })?;
                Ok(TargetStatus {
                    cluster: w.cluster,
                    name: w.name,
                    replicas: w.replicas,
                    updated_replicas: w.updated_replicas,
                    updated_ready_replicas: w.updated_ready_replicas,
                    failed_replicas: w.failed_replicas,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use rollgate_core::{FastShare, IntOrPercent};
    use rollgate_state::WorkloadRecord;

    fn record(cluster: &str, name: &str, replicas: u32) -> WorkloadRecord {
        WorkloadRecord {
            cluster: cluster.into(),
            namespace: "default".into(),
            name: name.into(),
            target_type: ObjectTypeRef::new("apps/v1", "Deployment"),
            labels: BTreeMap::new(),
            replicas,
            updated_replicas: 0,
            updated_ready_replicas: 0,
            failed_replicas: 0,
            desired_updated_replicas: None,
            desired_traffic: None,
            owner_run: None,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn store_apply_records_resolved_replicas() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_workload(&record("c1", "web", 10)).unwrap();
        let accessor = StoreWorkloads::new(store.clone());

        let traffic = TrafficStrategy {
            weight: Some(20),
            http: None,
        };
        let ctx = ApplyContext {
            namespace: "default",
            run: "default/run-1",
            batch_index: 0,
            traffic: &traffic,
        };
        let targets = vec![StepTarget::new(
            CrossClusterObjectRef::new("c1", "web"),
            IntOrPercent::Percent(25),
        )];
        accessor.apply(&ctx, &targets).await.unwrap();
        // Applying again changes nothing.
        accessor.apply(&ctx, &targets).await.unwrap();

        let w = store.get_workload("c1", "default", "web").unwrap().unwrap();
        assert_eq!(w.desired_updated_replicas, Some(3));
        assert_eq!(w.desired_traffic.unwrap().weight, Some(20));
        assert_eq!(w.owner_run.as_deref(), Some("default/run-1"));
    }

    #[tokio::test]
    async fn store_apply_resolves_fast_share_against_total() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_workload(&record("c1", "web", 10)).unwrap();
        let accessor = StoreWorkloads::new(store.clone());
        let traffic = TrafficStrategy::default();
        let ctx = ApplyContext {
            namespace: "default",
            run: "default/run-1",
            batch_index: 1,
            traffic: &traffic,
        };

        let target = StepTarget {
            share: Some(FastShare {
                beta: Some(IntOrPercent::Int(6)),
                batch: 1,
                of: 2,
            }),
            ..StepTarget::new(CrossClusterObjectRef::new("c1", "web"), IntOrPercent::Percent(50))
        };
        accessor.apply(&ctx, &[target]).await.unwrap();

        // Never below what the beta batch already asked for.
        let w = store.get_workload("c1", "default", "web").unwrap().unwrap();
        assert_eq!(w.desired_updated_replicas, Some(8));
    }

    #[tokio::test]
    async fn store_missing_target_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let accessor = StoreWorkloads::new(store);

        let err = accessor
            .status("default", &[CrossClusterObjectRef::new("c1", "ghost")])
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::TargetNotFound(key) if key == "c1/default/ghost"));

        let traffic = TrafficStrategy::default();
        let ctx = ApplyContext {
            namespace: "default",
            run: "default/run-1",
            batch_index: 0,
            traffic: &traffic,
        };
        let err = accessor
            .apply(
                &ctx,
                &[StepTarget::new(
                    CrossClusterObjectRef::new("c1", "ghost"),
                    IntOrPercent::FULL,
                )],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn store_status_reports_counts() {
        let store = StateStore::open_in_memory().unwrap();
        let mut w = record("c1", "web", 4);
        w.updated_replicas = 2;
        w.updated_ready_replicas = 1;
        w.failed_replicas = 1;
        store.put_workload(&w).unwrap();

        let statuses = StoreWorkloads::new(store)
            .status("default", &[CrossClusterObjectRef::new("c1", "web")])
            .await
            .unwrap();
        assert_eq!(statuses[0].replicas, 4);
        assert_eq!(statuses[0].updated_ready_replicas, 1);
        assert_eq!(statuses[0].failed_replicas, 1);
    }

    #[test]
    fn registry_lookup_and_fallback() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = ObjectTypeRef::new("apps/v1", "Deployment");
        let stateful = ObjectTypeRef::new("apps/v1", "StatefulSet");

        let mut registry = WorkloadRegistry::new();
        registry.register(deployment.clone(), Arc::new(StoreWorkloads::new(store.clone())));
        assert!(registry.get(&deployment).is_ok());
        assert!(matches!(
            registry.get(&stateful),
            Err(RolloutError::UnknownTargetType(_))
        ));

        let registry = registry.with_fallback(Arc::new(StoreWorkloads::new(store)));
        assert!(registry.get(&stateful).is_ok());
    }
}
