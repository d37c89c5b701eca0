//! rollgate-webhook — external go/no-go checks around batch steps.
//!
//! A run may register webhooks at the `PreBatchStepHook` and
//! `PostBatchStepHook` points. The gate consults every webhook registered
//! for a hook point, polls each at its own period, and folds the outcomes
//! into a single decision.
//!
//! # Architecture
//!
//! ```text
//! WebhookGate::evaluate(hook, record, context, now)
//!   ├── per webhook: WebhookRecord in BatchRecord (persisted)
//!   │   ├── deadline check (timeoutSeconds since first attempt)
//!   │   ├── WebhookClient::call() → WebhookResponse   (at most once per pass)
//!   │   └── record_attempt() → Running | Succeeded | Failed
//!   └── GateOutcome: Pending(requeue after) | Passed | Failed
//! ```
//!
//! A pass never sleeps: when a webhook is not yet due, the gate returns
//! `Pending` with the delay until the earliest due attempt, and the caller
//! re-invokes it later. Elapsed time is measured from the first recorded
//! attempt, so a restarted process picks up where the last one stopped.

pub mod client;
pub mod error;
pub mod gate;

pub use client::{
    HttpWebhookClient, ResponseCode, RunIdentity, TargetSummary, WebhookClient, WebhookResponse,
    WebhookReview,
};
pub use error::{WebhookError, WebhookResult};
pub use gate::{GateOutcome, ReviewContext, WebhookGate, record_attempt};
