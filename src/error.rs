//! Top-level error type
//!
//! Tagged variants rather than ad-hoc shape checks, per `SPEC_FULL.md` §9 /
//! spec.md §7. `DurableSleep`/`WaitingForSignal` are *not* represented here —
//! those are success-channel [`crate::execution::StepOutcome`] /
//! [`crate::execution::ExecutionOutcome`] variants, not errors.

use uuid::Uuid;

use crate::persistence::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Unknown execution or workflow definition.
    #[error("not found: {0}")]
    NotFound(String),

    /// Could not acquire the execution lock; retryable with >= 30s backoff.
    #[error("execution {0} is locked")]
    Locked(Uuid),

    /// Lost a step-result insert race and the peer is still running.
    #[error("contention on step {step_name} of execution {execution_id}")]
    Contention { execution_id: Uuid, step_name: String },

    /// Execution was observed `cancelled`; terminal for this delivery.
    #[error("execution {0} was cancelled")]
    Cancelled(Uuid),

    /// Network/timeout/5xx/429 from a tool invocation or the database.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Validation, authorization, or other non-retryable client error.
    #[error("fatal step failure: {0}")]
    FatalStep(String),

    /// `deadlineAtEpochMs` exceeded.
    #[error("execution {0} exceeded its deadline")]
    Timeout(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Whether the scheduler should treat this as `shouldRetry=true`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Locked(_)
                | Self::Contention { .. }
                | Self::Retryable(_)
                | Self::Store(StoreError::Database(_))
        )
    }
}
