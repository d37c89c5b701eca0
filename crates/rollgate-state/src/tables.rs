//! redb table definitions for the rollgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Rollout strategies keyed by `{namespace}/{name}`.
pub const STRATEGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("strategies");

/// Runs keyed by `{namespace}/{name}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Store-managed workloads keyed by `{cluster}/{namespace}/{name}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");
