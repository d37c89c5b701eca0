//! rollgate-state — embedded state store for rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), persists rollout strategies,
//! runs, and store-managed workloads.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns under
//! composite keys (`{namespace}/{name}`, `{cluster}/{namespace}/{name}`).
//!
//! Runs are written with optimistic concurrency: every write carries the
//! `resource_version` it was read at, and the store rejects it with
//! [`StateError::Conflict`] if another writer got there first. redb write
//! transactions are serialized, so the check and the write are atomic.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
