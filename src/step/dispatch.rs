//! Dispatches a single step invocation by kind
//!
//! This module never writes a checkpoint row — the workflow executor owns
//! that (guarded `createStepResult`/`updateStepResult`), since it alone
//! knows whether it won the race for this `(executionId, stepName)`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::persistence::ExecutionStore;
use crate::reference::{resolve_template, RefContext};
use crate::workflow::StepAction;

use super::code::CodeRunner;
use super::tool::ToolInvoker;

/// One-shot outcome of dispatching a step. `Completed` is the only terminal
/// success variant; the other two are non-error suspension points (spec.md
/// §9 "durable control flow without exceptions for control").
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Value),
    Sleeping { wake_at_epoch_ms: i64 },
    WaitingForSignal {
        signal_name: String,
        timeout_at_epoch_ms: Option<i64>,
    },
}

/// External collaborators a step dispatch needs.
pub struct StepDeps {
    pub tool_invoker: Arc<dyn ToolInvoker>,
    pub code_runner: Arc<dyn CodeRunner>,
    /// Sleeps at or under this duration run in-process (spec.md §4.4).
    pub sleep_inline_threshold: Duration,
}

#[instrument(skip(action, ctx, store, deps), fields(execution_id = %execution_id))]
pub async fn dispatch<S: ExecutionStore + ?Sized>(
    action: &StepAction,
    input_template: &Value,
    ctx: &RefContext<'_>,
    execution_id: Uuid,
    store: &S,
    deps: &StepDeps,
    now: DateTime<Utc>,
) -> Result<StepOutcome, ExecutorError> {
    match action {
        StepAction::Tool { connection_id, tool_name } => {
            let input = resolve_or_fatal(input_template, ctx)?;
            match deps.tool_invoker.invoke(connection_id, tool_name, input).await {
                Ok(response) => Ok(StepOutcome::Completed(response.unwrap_output())),
                Err(e) if e.is_retryable() => Err(ExecutorError::Retryable(e.to_string())),
                Err(e) => Err(ExecutorError::FatalStep(e.to_string())),
            }
        }

        StepAction::Code { source } => {
            let input = resolve_or_fatal(input_template, ctx)?;
            deps.code_runner
                .run(source, input)
                .await
                .map(StepOutcome::Completed)
                .map_err(|e| ExecutorError::FatalStep(e.to_string()))
        }

        StepAction::Sleep { sleep_ms, sleep_until } => {
            let wake_at_epoch_ms = resolve_wake_at(sleep_ms.as_ref(), sleep_until.as_ref(), ctx, now)?;
            let remaining_ms = wake_at_epoch_ms - now.timestamp_millis();

            if remaining_ms <= deps.sleep_inline_threshold.as_millis() as i64 {
                if remaining_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(remaining_ms as u64)).await;
                }
                Ok(StepOutcome::Completed(
                    serde_json::json!({ "wokeAtEpochMs": wake_at_epoch_ms }),
                ))
            } else {
                Ok(StepOutcome::Sleeping { wake_at_epoch_ms })
            }
        }

        StepAction::WaitForSignal { signal_name, timeout_ms } => {
            match store.consume_signal(execution_id, signal_name).await? {
                Some(signal) => Ok(StepOutcome::Completed(signal.payload.unwrap_or(Value::Null))),
                None => Ok(StepOutcome::WaitingForSignal {
                    signal_name: signal_name.clone(),
                    timeout_at_epoch_ms: timeout_ms.map(|ms| now.timestamp_millis() + ms as i64),
                }),
            }
        }
    }
}

fn resolve_or_fatal(template: &Value, ctx: &RefContext<'_>) -> Result<Value, ExecutorError> {
    let resolved = resolve_template(template, ctx);
    if !resolved.ok() {
        return Err(ExecutorError::FatalStep(format!(
            "unresolved references: {:?}",
            resolved.errors
        )));
    }
    Ok(resolved.value)
}

fn resolve_wake_at(
    sleep_ms: Option<&Value>,
    sleep_until: Option<&Value>,
    ctx: &RefContext<'_>,
    now: DateTime<Utc>,
) -> Result<i64, ExecutorError> {
    if let Some(template) = sleep_ms {
        let value = resolve_or_fatal(template, ctx)?;
        let ms = value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .ok_or_else(|| ExecutorError::FatalStep("sleepMs did not resolve to a number".into()))?;
        return Ok(now.timestamp_millis() + ms);
    }

    if let Some(template) = sleep_until {
        let value = resolve_or_fatal(template, ctx)?;
        return match value {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ExecutorError::FatalStep("sleepUntil number was not an integer".into())),
            Value::String(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| ExecutorError::FatalStep(format!("invalid sleepUntil timestamp: {e}"))),
            other => Err(ExecutorError::FatalStep(format!(
                "sleepUntil resolved to unsupported type: {other}"
            ))),
        };
    }

    Err(ExecutorError::FatalStep(
        "sleep step has neither sleepMs nor sleepUntil".into(),
    ))
}
