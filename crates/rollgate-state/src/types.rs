//! Records owned by the state store itself.
//!
//! Strategies and runs are defined in `rollgate-core`; this module adds the
//! workload record used by store-managed workloads, whose replica counts
//! are reported by external agents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rollgate_core::{ObjectTypeRef, Timestamp, TrafficStrategy};

/// A workload whose rollout progress is reported through the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRecord {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub target_type: ObjectTypeRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub updated_ready_replicas: u32,
    #[serde(default)]
    pub failed_replicas: u32,
    /// Updated replicas requested by the active run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_updated_replicas: Option<u32>,
    /// Traffic requested by the active run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_traffic: Option<TrafficStrategy>,
    /// `{namespace}/{name}` of the run that last applied to this workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_run: Option<String>,
    pub updated_at: Timestamp,
}

impl WorkloadRecord {
    pub fn table_key(&self) -> String {
        workload_key(&self.cluster, &self.namespace, &self.name)
    }
}

/// Build the composite key for the workloads table.
pub fn workload_key(cluster: &str, namespace: &str, name: &str) -> String {
    format!("{cluster}/{namespace}/{name}")
}

/// Build the composite key for namespaced records.
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
