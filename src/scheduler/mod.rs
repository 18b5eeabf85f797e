//! Re-entry abstraction (`SPEC_FULL.md` §4.8)
//!
//! The executor itself never decides when it runs again; a `Scheduler`
//! delivers it. Two implementations are interchangeable: an in-process
//! delay queue ([`QueueScheduler`]), and a webhook front-end backed by a
//! periodic database scan, for which [`WebhookVerifier`] and
//! [`decide_reentry`] provide the signing and result-mapping pieces.

mod queue;
mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use queue::{QueueScheduler, ReentryJob};
pub use webhook::{decide_reentry, is_too_old, ReentryDecision, WebhookVerifier};

/// Carried through a re-entry delivery: the caller's auth/identity blob and
/// the retry bookkeeping needed for backoff.
#[derive(Debug, Clone, Default)]
pub struct ReentryContext {
    pub runtime_context: Option<Value>,
    pub retry_count: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Deliver a re-entry for `execution_id` after `delay`.
    async fn schedule_after(
        &self,
        execution_id: Uuid,
        delay: Duration,
        ctx: ReentryContext,
    ) -> Result<(), SchedulerError>;

    /// Deliver a re-entry for `execution_id` at `epoch_ms`.
    async fn schedule_at(
        &self,
        execution_id: Uuid,
        epoch_ms: i64,
        ctx: ReentryContext,
    ) -> Result<(), SchedulerError>;
}
