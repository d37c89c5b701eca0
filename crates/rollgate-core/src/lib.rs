//! rollgate-core — shared declarative types for progressive batch releases.
//!
//! - **`types`** — strategies, steps, traffic, toleration, webhooks
//! - **`run`** — the run record and its resumable status
//! - **`intstr`** — int-or-percentage replica values
//! - **`selector`** — label selectors for target matching
//! - **`config`** — `rollgate.toml` daemon configuration

pub mod config;
pub mod intstr;
pub mod run;
pub mod selector;
pub mod types;

pub use config::DaemonConfig;
pub use intstr::IntOrPercent;
pub use run::*;
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
pub use types::*;
