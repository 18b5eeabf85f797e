//! `WorkflowExecutor`: the per-delivery orchestration loop (spec.md §4.6)
//!
//! One call to [`WorkflowExecutor::deliver`] is "run this execution as far as
//! it will go": acquire the lock, replay completed steps, advance phase by
//! phase until the workflow suspends (sleep / wait-for-signal / cancelled) or
//! finishes (completed / failed), then release the lock. The scheduler is
//! responsible for arranging the next delivery; this module never sleeps or
//! loops on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::control_flow::{self, StepGroup};
use crate::error::ExecutorError;
use crate::execution::{ExecutionOutcome, ExecutionPatch, ExecutionStatus, StepResult};
use crate::lock;
use crate::persistence::{ExecutionStore, StepResultPatch, WorkflowRepository};
use crate::reference::{resolve_template, RefContext};
use crate::reliability::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::step::{self, ForEachOutcome, IterationOutcome, StepDeps, StepOutcome};
use crate::trigger;
use crate::workflow::{ForEachConfig, ParallelGroupMode, Step, StepAction, WorkflowDefinition};

/// A non-completed step-result row younger than this is treated as a live
/// claim by a concurrent peer; older than this, it's treated as abandoned —
/// a crashed worker, or a prior retryable failure that never reached a
/// checkpoint — and the step is redispatched.
const CONTENTION_GRACE_MS: i64 = 30_000;

/// Backoff hint returned when the execution lock itself couldn't be acquired.
const LOCK_BUSY_BACKOFF: Duration = Duration::from_secs(30);

pub struct WorkflowExecutor<S, Sch> {
    store: Arc<S>,
    scheduler: Arc<Sch>,
    step_deps: StepDeps,
    lock_duration: Duration,
    foreach_default_max_iterations: u32,
    foreach_hard_cap: usize,
    retry_policy: RetryPolicy,
}

impl<S, Sch> WorkflowExecutor<S, Sch>
where
    S: ExecutionStore + WorkflowRepository,
    Sch: Scheduler,
{
    pub fn new(store: Arc<S>, scheduler: Arc<Sch>, step_deps: StepDeps, config: &EngineConfig) -> Self {
        let retry_policy = RetryPolicy::exponential()
            .with_max_attempts(config.db_retry_max_attempts)
            .with_initial_interval(config.db_retry_initial)
            .with_max_interval(config.db_retry_max);
        Self {
            store,
            scheduler,
            step_deps,
            lock_duration: config.lock_duration,
            foreach_default_max_iterations: config.foreach_default_max_iterations,
            foreach_hard_cap: config.foreach_hard_cap as usize,
            retry_policy,
        }
    }

    /// Drives one execution forward. Safe to call again on an already
    /// terminal execution — it just reports the terminal outcome.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn deliver(&self, execution_id: Uuid) -> Result<ExecutionOutcome, ExecutorError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(execution_id.to_string()))?;

        match execution.status {
            ExecutionStatus::Completed => {
                return Ok(ExecutionOutcome::Completed {
                    output: execution.output.unwrap_or(Value::Null),
                });
            }
            ExecutionStatus::Failed => {
                return Ok(ExecutionOutcome::Failed {
                    error: execution.error.unwrap_or_default(),
                });
            }
            ExecutionStatus::Cancelled => return Ok(ExecutionOutcome::Cancelled),
            ExecutionStatus::Enqueued | ExecutionStatus::Running => {}
        }

        let retry_count = execution.retry_count;

        let locked_result = lock::with_lock(self.store.as_ref(), execution_id, self.lock_duration, |_lock_id| {
            self.run_locked(execution_id)
        })
        .await;

        match locked_result {
            Ok(outcome) => Ok(outcome),
            Err(ExecutorError::Locked(id)) => {
                warn!(%id, "execution lock busy, deferring delivery");
                Ok(ExecutionOutcome::NeedsRetry {
                    delay: LOCK_BUSY_BACKOFF,
                    retry_count,
                })
            }
            Err(e) if e.is_retryable() => {
                let next_retry_count = retry_count + 1;
                let delay = self.retry_policy.delay_for_attempt(next_retry_count as u32 + 1);
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionPatch {
                            retry_count: Some(next_retry_count),
                            last_error: Some(e.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ExecutionOutcome::NeedsRetry {
                    delay,
                    retry_count: next_retry_count,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.fail_execution(execution_id, message.clone()).await?;
                Ok(ExecutionOutcome::Failed { error: message })
            }
        }
    }

    /// Runs under the execution lock: reload state, advance phases, suspend
    /// or finish. Never releases the lock itself — `with_lock` does that.
    async fn run_locked(&self, execution_id: Uuid) -> Result<ExecutionOutcome, ExecutorError> {
        let now = Utc::now();

        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(execution_id.to_string()))?;

        if execution.status == ExecutionStatus::Cancelled {
            return Ok(ExecutionOutcome::Cancelled);
        }
        if execution.past_deadline(now.timestamp_millis()) {
            self.fail_execution(execution_id, "execution exceeded its deadline".into())
                .await?;
            return Err(ExecutorError::Timeout(execution_id));
        }

        let workflow = self
            .store
            .get_workflow(&execution.workflow_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(execution.workflow_id.clone()))?;

        let completed_rows = self.store.get_step_results(execution_id).await?;
        let mut step_outputs: HashMap<String, Value> = HashMap::new();
        for row in &completed_rows {
            if row.is_completed() && row.error.is_none() {
                step_outputs.insert(row.step_name.clone(), row.output.clone().unwrap_or(Value::Null));
            }
        }

        if execution.status == ExecutionStatus::Enqueued {
            self.store
                .update_execution(
                    execution_id,
                    ExecutionPatch {
                        status: Some(ExecutionStatus::Running),
                        started_at_epoch_ms: Some(now.timestamp_millis()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let phases = control_flow::compute_phases(&workflow);
        let mut last_output: Option<Value> = None;

        for phase in &phases {
            if let Some(fresh) = self.store.get_execution(execution_id).await? {
                if fresh.status == ExecutionStatus::Cancelled {
                    return Ok(ExecutionOutcome::Cancelled);
                }
                if fresh.past_deadline(Utc::now().timestamp_millis()) {
                    self.fail_execution(execution_id, "execution exceeded its deadline".into())
                        .await?;
                    return Err(ExecutorError::Timeout(execution_id));
                }
            }

            let groups = control_flow::group_steps(&workflow, phase);
            let ctx = RefContext::new(&step_outputs, &execution.input);

            let results =
                futures::future::join_all(groups.iter().map(|group| self.run_group(execution_id, group, &ctx, now))).await;

            let mut suspension: Option<ExecutionOutcome> = None;
            let mut fatal_errors: Vec<String> = Vec::new();
            let mut retryable_error: Option<String> = None;

            for result in results {
                match result {
                    GroupResult::Steps(outputs) => {
                        for (name, value) in outputs {
                            step_outputs.insert(name, value);
                        }
                    }
                    GroupResult::Suspend(outcome) => {
                        if suspension.is_none() {
                            suspension = Some(outcome);
                        }
                    }
                    GroupResult::Failed {
                        step_name,
                        error,
                        retryable,
                    } => {
                        if retryable {
                            retryable_error.get_or_insert(format!("{step_name}: {error}"));
                        } else {
                            fatal_errors.push(format!("{step_name}: {error}"));
                        }
                    }
                }
            }

            if !fatal_errors.is_empty() {
                let message = fatal_errors.join("; ");
                self.fail_execution(execution_id, message.clone()).await?;
                return Ok(ExecutionOutcome::Failed { error: message });
            }
            if let Some(message) = retryable_error {
                return Err(ExecutorError::Retryable(message));
            }
            if let Some(outcome) = suspension {
                return Ok(outcome);
            }

            for name in phase {
                if let Some(step) = workflow.step(name) {
                    if !step.exclude_from_workflow_output {
                        if let Some(value) = step_outputs.get(name) {
                            last_output = Some(value.clone());
                        }
                    }
                }
            }
        }

        let output = last_output.unwrap_or_else(|| summary_output(&workflow, &step_outputs));
        let completed_at = Utc::now().timestamp_millis();

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Completed),
                    output: Some(output.clone()),
                    completed_at_epoch_ms: Some(completed_at),
                    retry_count: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        let output_ctx = RefContext::new(&step_outputs, &execution.input).with_output(&output);
        let trigger_outcomes = trigger::fire_triggers(
            self.store.as_ref(),
            self.scheduler.as_ref(),
            &workflow.triggers,
            execution_id,
            &output_ctx,
            execution.runtime_context.clone(),
            self.foreach_hard_cap,
        )
        .await;
        for outcome in &trigger_outcomes {
            if let trigger::TriggerOutcome::Failed { reason } = outcome {
                warn!(%execution_id, %reason, "trigger fan-out failed for a completed execution");
            }
        }

        Ok(ExecutionOutcome::Completed { output })
    }

    async fn run_group(&self, execution_id: Uuid, group: &StepGroup<'_>, ctx: &RefContext<'_>, now: chrono::DateTime<Utc>) -> GroupResult {
        match group {
            StepGroup::Single(step) => self.run_single(execution_id, step, ctx, now).await,
            StepGroup::Group { name, mode, steps } => {
                self.run_named_group(execution_id, name, *mode, steps.as_slice(), ctx, now).await
            }
        }
    }

    async fn run_single(&self, execution_id: Uuid, step: &Step, ctx: &RefContext<'_>, now: chrono::DateTime<Utc>) -> GroupResult {
        match self.run_step(execution_id, step, ctx, now).await {
            Ok(StepOutcome::Completed(value)) => GroupResult::Steps(vec![(step.name.clone(), value)]),
            Ok(StepOutcome::Sleeping { wake_at_epoch_ms }) => {
                GroupResult::Suspend(ExecutionOutcome::Sleeping { wake_at_epoch_ms })
            }
            Ok(StepOutcome::WaitingForSignal {
                signal_name,
                timeout_at_epoch_ms,
            }) => GroupResult::Suspend(ExecutionOutcome::WaitingForSignal {
                signal_name,
                step_name: step.name.clone(),
                timeout_at_epoch_ms,
            }),
            Err(e) => GroupResult::Failed {
                step_name: step.name.clone(),
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }

    async fn run_named_group(
        &self,
        execution_id: Uuid,
        name: &str,
        mode: ParallelGroupMode,
        steps: &[&Step],
        ctx: &RefContext<'_>,
        now: chrono::DateTime<Utc>,
    ) -> GroupResult {
        match mode {
            ParallelGroupMode::All => {
                let results = futures::future::join_all(steps.iter().map(|step| self.run_step(execution_id, step, ctx, now))).await;

                let mut outputs = Vec::with_capacity(steps.len());
                for (step, result) in steps.iter().zip(results) {
                    match result {
                        Ok(StepOutcome::Completed(value)) => outputs.push((step.name.clone(), value)),
                        Ok(StepOutcome::Sleeping { wake_at_epoch_ms }) => {
                            return GroupResult::Suspend(ExecutionOutcome::Sleeping { wake_at_epoch_ms })
                        }
                        Ok(StepOutcome::WaitingForSignal {
                            signal_name,
                            timeout_at_epoch_ms,
                        }) => {
                            return GroupResult::Suspend(ExecutionOutcome::WaitingForSignal {
                                signal_name,
                                step_name: step.name.clone(),
                                timeout_at_epoch_ms,
                            })
                        }
                        Err(e) => {
                            return GroupResult::Failed {
                                step_name: step.name.clone(),
                                retryable: e.is_retryable(),
                                error: e.to_string(),
                            }
                        }
                    }
                }
                let group_value = Value::Array(outputs.iter().map(|(_, v)| v.clone()).collect());
                outputs.push((format!("group:{name}"), group_value));
                GroupResult::Steps(outputs)
            }

            ParallelGroupMode::Race => {
                let mut pending: FuturesUnordered<_> = steps
                    .iter()
                    .map(|step| {
                        let step = *step;
                        async move { (step, self.run_step(execution_id, step, ctx, now).await) }
                    })
                    .collect();

                let mut last_failure: Option<(String, String, bool)> = None;
                while let Some((step, result)) = pending.next().await {
                    match result {
                        Ok(StepOutcome::Completed(value)) => {
                            return GroupResult::Steps(vec![
                                (step.name.clone(), value.clone()),
                                (format!("group:{name}"), value),
                            ]);
                        }
                        Ok(StepOutcome::Sleeping { wake_at_epoch_ms }) => {
                            return GroupResult::Suspend(ExecutionOutcome::Sleeping { wake_at_epoch_ms })
                        }
                        Ok(StepOutcome::WaitingForSignal {
                            signal_name,
                            timeout_at_epoch_ms,
                        }) => {
                            return GroupResult::Suspend(ExecutionOutcome::WaitingForSignal {
                                signal_name,
                                step_name: step.name.clone(),
                                timeout_at_epoch_ms,
                            })
                        }
                        Err(e) => last_failure = Some((step.name.clone(), e.to_string(), e.is_retryable())),
                    }
                }

                match last_failure {
                    Some((step_name, error, retryable)) => GroupResult::Failed {
                        step_name,
                        error,
                        retryable,
                    },
                    None => GroupResult::Failed {
                        step_name: name.to_string(),
                        error: "race group had no steps".into(),
                        retryable: false,
                    },
                }
            }

            ParallelGroupMode::AllSettled => {
                let results = futures::future::join_all(steps.iter().map(|step| self.run_step(execution_id, step, ctx, now))).await;

                let mut outputs = Vec::with_capacity(steps.len());
                let mut settled = Vec::with_capacity(steps.len());
                for (step, result) in steps.iter().zip(results) {
                    match result {
                        Ok(StepOutcome::Completed(value)) => {
                            settled.push(json!({"status": "fulfilled", "value": value}));
                            outputs.push((step.name.clone(), value));
                        }
                        Ok(StepOutcome::Sleeping { wake_at_epoch_ms }) => {
                            return GroupResult::Suspend(ExecutionOutcome::Sleeping { wake_at_epoch_ms })
                        }
                        Ok(StepOutcome::WaitingForSignal {
                            signal_name,
                            timeout_at_epoch_ms,
                        }) => {
                            return GroupResult::Suspend(ExecutionOutcome::WaitingForSignal {
                                signal_name,
                                step_name: step.name.clone(),
                                timeout_at_epoch_ms,
                            })
                        }
                        Err(e) => settled.push(json!({"status": "rejected", "reason": e.to_string()})),
                    }
                }
                outputs.push((format!("group:{name}"), Value::Array(settled)));
                GroupResult::Steps(outputs)
            }
        }
    }

    /// Runs one named step, honoring the `createStepResult` race and
    /// replaying completed rows. WaitForSignal steps tolerate re-dispatch
    /// from a non-completed row (multiple observers are expected); other
    /// kinds treat a fresh non-completed row as contention from a peer.
    async fn run_step(&self, execution_id: Uuid, step: &Step, ctx: &RefContext<'_>, now: chrono::DateTime<Utc>) -> Result<StepOutcome, ExecutorError> {
        let is_wait_for_signal = matches!(step.action, StepAction::WaitForSignal { .. });

        let slot = self.store.create_step_result(execution_id, &step.name).await?;
        if !slot.created {
            if let Some(outcome) = completed_outcome(&slot.row)? {
                return Ok(outcome);
            }
            if !is_wait_for_signal {
                let age_ms = now.timestamp_millis() - slot.row.started_at_epoch_ms;
                if age_ms < CONTENTION_GRACE_MS {
                    return Err(ExecutorError::Contention {
                        execution_id,
                        step_name: step.name.clone(),
                    });
                }
            }
        }

        self.dispatch_and_checkpoint(execution_id, step, ctx, now).await
    }

    async fn dispatch_and_checkpoint(&self, execution_id: Uuid, step: &Step, ctx: &RefContext<'_>, now: chrono::DateTime<Utc>) -> Result<StepOutcome, ExecutorError> {
        let result = if let Some(for_each) = step.config.as_ref().and_then(|c| c.for_each.as_ref()) {
            self.dispatch_for_each(execution_id, step, for_each, ctx, now).await
        } else {
            step::dispatch(&step.action, &step.input, ctx, execution_id, self.store.as_ref(), &self.step_deps, now).await
        };

        match result {
            Ok(StepOutcome::Completed(value)) => {
                self.store
                    .update_step_result(
                        execution_id,
                        &step.name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(Utc::now().timestamp_millis()),
                            output: Some(value.clone()),
                            error: None,
                        },
                    )
                    .await?;
                Ok(StepOutcome::Completed(value))
            }
            Ok(other) => Ok(other),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                self.store
                    .update_step_result(
                        execution_id,
                        &step.name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(Utc::now().timestamp_millis()),
                            output: None,
                            error: Some(e.to_string()),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// `forEach` steps never suspend: a nested sleep/waitForSignal inside an
    /// iteration is reported as a fatal step error rather than propagated as
    /// a suspension, since there's no single wake-up point for the group.
    async fn dispatch_for_each(
        &self,
        execution_id: Uuid,
        step: &Step,
        for_each: &ForEachConfig,
        ctx: &RefContext<'_>,
        now: chrono::DateTime<Utc>,
    ) -> Result<StepOutcome, ExecutorError> {
        let items_resolved = resolve_template(&for_each.items, ctx);
        if !items_resolved.ok() {
            return Err(ExecutorError::FatalStep(format!(
                "forEach items failed to resolve: {:?}",
                items_resolved.errors
            )));
        }
        let items = step::coerce_items(&items_resolved.value)
            .ok_or_else(|| ExecutorError::FatalStep("forEach items did not resolve to an array".into()))?;
        let cap = step.max_iterations.unwrap_or(self.foreach_default_max_iterations);

        let outcome = step::run_foreach(&items, for_each.mode, for_each.max_concurrency, cap, |index, item| {
            let iteration_ctx = ctx.with_iteration(item, index);
            let resolved = resolve_template(&step.input, &iteration_ctx);
            async move {
                if !resolved.ok() {
                    return Err(ExecutorError::FatalStep(format!(
                        "forEach iteration {index} failed to resolve: {:?}",
                        resolved.errors
                    )));
                }
                let checkpoint_name = format!("{}[{}]", step.name, index);
                self.dispatch_iteration(execution_id, &checkpoint_name, &step.action, resolved.value, &iteration_ctx, now)
                    .await
            }
        })
        .await?;

        Ok(StepOutcome::Completed(for_each_outcome_to_value(outcome)))
    }

    async fn dispatch_iteration(
        &self,
        execution_id: Uuid,
        checkpoint_name: &str,
        action: &StepAction,
        input: Value,
        ctx: &RefContext<'_>,
        now: chrono::DateTime<Utc>,
    ) -> Result<Value, ExecutorError> {
        let slot = self.store.create_step_result(execution_id, checkpoint_name).await?;
        if !slot.created {
            if let Some(value) = completed_value(&slot.row)? {
                return Ok(value);
            }
            let age_ms = now.timestamp_millis() - slot.row.started_at_epoch_ms;
            if age_ms < CONTENTION_GRACE_MS {
                return Err(ExecutorError::Contention {
                    execution_id,
                    step_name: checkpoint_name.to_string(),
                });
            }
        }

        match step::dispatch(action, &input, ctx, execution_id, self.store.as_ref(), &self.step_deps, now).await {
            Ok(StepOutcome::Completed(value)) => {
                self.store
                    .update_step_result(
                        execution_id,
                        checkpoint_name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(Utc::now().timestamp_millis()),
                            output: Some(value.clone()),
                            error: None,
                        },
                    )
                    .await?;
                Ok(value)
            }
            Ok(StepOutcome::Sleeping { .. }) | Ok(StepOutcome::WaitingForSignal { .. }) => Err(ExecutorError::FatalStep(
                "sleep / waitForSignal steps are not supported inside a forEach iteration".into(),
            )),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                self.store
                    .update_step_result(
                        execution_id,
                        checkpoint_name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(Utc::now().timestamp_millis()),
                            output: None,
                            error: Some(e.to_string()),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn fail_execution(&self, execution_id: Uuid, error: String) -> Result<(), ExecutorError> {
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    error: Some(error),
                    completed_at_epoch_ms: Some(Utc::now().timestamp_millis()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// What running one [`StepGroup`] produced, folded back into the phase loop.
enum GroupResult {
    Steps(Vec<(String, Value)>),
    Suspend(ExecutionOutcome),
    Failed { step_name: String, error: String, retryable: bool },
}

fn completed_value(row: &StepResult) -> Result<Option<Value>, ExecutorError> {
    if !row.is_completed() {
        return Ok(None);
    }
    match &row.error {
        Some(err) => Err(ExecutorError::FatalStep(err.clone())),
        None => Ok(Some(row.output.clone().unwrap_or(Value::Null))),
    }
}

fn completed_outcome(row: &StepResult) -> Result<Option<StepOutcome>, ExecutorError> {
    Ok(completed_value(row)?.map(StepOutcome::Completed))
}

fn for_each_outcome_to_value(outcome: ForEachOutcome) -> Value {
    match outcome {
        ForEachOutcome::Values(values) => Value::Array(values),
        ForEachOutcome::Race { index, item, value } => json!({"index": index, "item": item, "value": value}),
        ForEachOutcome::AllSettled(results) => Value::Array(
            results
                .into_iter()
                .map(|r| match r {
                    IterationOutcome::Fulfilled { index, value } => json!({"status": "fulfilled", "index": index, "value": value}),
                    IterationOutcome::Rejected { index, error } => json!({"status": "rejected", "index": index, "reason": error}),
                })
                .collect(),
        ),
    }
}

/// Output when every step ran but all of them were excluded from the
/// workflow output.
fn summary_output(workflow: &WorkflowDefinition, step_outputs: &HashMap<String, Value>) -> Value {
    let completed_steps: Vec<Value> = workflow
        .steps
        .iter()
        .filter(|s| step_outputs.contains_key(&s.name))
        .map(|s| Value::String(s.name.clone()))
        .collect();
    let last_step = workflow.steps.iter().filter(|s| step_outputs.contains_key(&s.name)).last().map(|s| s.name.clone());

    json!({
        "_summary": true,
        "completedSteps": completed_steps,
        "lastStep": last_step,
        "message": "every step output was excluded from the workflow output",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::NewExecution;
    use crate::persistence::InMemoryExecutionStore;
    use crate::scheduler::QueueScheduler;
    use crate::step::{CodeRunError, CodeRunner, ToolInvokeError, ToolInvoker, ToolResponse};
    use crate::workflow::{ParallelConfig, Signal, StepConfig};
    use async_trait::async_trait;

    struct EchoCodeRunner;

    #[async_trait]
    impl CodeRunner for EchoCodeRunner {
        async fn run(&self, _source: &str, input: Value) -> Result<Value, CodeRunError> {
            Ok(input)
        }
    }

    struct NoopToolInvoker;

    #[async_trait]
    impl ToolInvoker for NoopToolInvoker {
        async fn invoke(&self, _connection_id: &str, _tool_name: &str, input: Value) -> Result<ToolResponse, ToolInvokeError> {
            Ok(ToolResponse::raw(input))
        }
    }

    fn deps() -> StepDeps {
        StepDeps {
            tool_invoker: Arc::new(NoopToolInvoker),
            code_runner: Arc::new(EchoCodeRunner),
            sleep_inline_threshold: Duration::from_secs(5),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            database_url: "postgres://localhost/test".into(),
            lock_duration: Duration::from_secs(300),
            db_retry_max_attempts: 5,
            db_retry_initial: Duration::from_millis(10),
            db_retry_max: Duration::from_millis(100),
            sleep_inline_threshold: Duration::from_secs(5),
            foreach_default_max_iterations: 100,
            foreach_hard_cap: 100,
            message_age_cap: Duration::from_secs(86_400),
            webhook_signing_key: None,
            webhook_next_signing_key: None,
        }
    }

    fn step(name: &str, action: StepAction, input: Value) -> Step {
        Step {
            name: name.to_string(),
            action,
            input,
            config: None,
            max_iterations: None,
            exclude_from_workflow_output: false,
        }
    }

    async fn new_execution(store: &InMemoryExecutionStore, workflow_id: &str, input: Value) -> crate::execution::WorkflowExecution {
        store
            .create_execution(NewExecution {
                workflow_id: workflow_id.to_string(),
                input,
                timeout_ms: None,
                start_at_epoch_ms: None,
                parent_execution_id: None,
                runtime_context: None,
                created_by: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completes_a_linear_two_step_workflow() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![
                step("A", StepAction::Code { source: "1".into() }, json!({"x": "@input.x"})),
                step("B", StepAction::Code { source: "1".into() }, json!({"y": "@A.x"})),
            ],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({"x": 1})).await;

        let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());
        let outcome = executor.deliver(execution.id).await.unwrap();

        match outcome {
            ExecutionOutcome::Completed { output } => assert_eq!(output, json!({"y": 1})),
            other => panic!("expected Completed, got {other:?}"),
        }

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn redelivery_replays_completed_steps_without_rerunning_them() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![
                step("A", StepAction::Code { source: "1".into() }, json!({"x": 1})),
                step(
                    "B",
                    StepAction::WaitForSignal {
                        signal_name: "go".into(),
                        timeout_ms: None,
                    },
                    json!({}),
                ),
            ],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({})).await;
        let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());

        let first = executor.deliver(execution.id).await.unwrap();
        assert!(matches!(first, ExecutionOutcome::WaitingForSignal { .. }));

        let a_row = store.get_step_result(execution.id, "A").await.unwrap().unwrap();
        assert!(a_row.is_completed());

        store.send_signal(Signal::new(execution.id, "go", Some(json!({"ok": true})))).await.unwrap();

        let second = executor.deliver(execution.id).await.unwrap();
        match second {
            ExecutionOutcome::Completed { .. } => {}
            other => panic!("expected Completed, got {other:?}"),
        }

        let a_row_after = store.get_step_result(execution.id, "A").await.unwrap().unwrap();
        assert_eq!(a_row.completed_at_epoch_ms, a_row_after.completed_at_epoch_ms);
    }

    #[tokio::test]
    async fn fatal_step_failure_marks_execution_failed() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        struct FailingCodeRunner;
        #[async_trait]
        impl CodeRunner for FailingCodeRunner {
            async fn run(&self, _source: &str, _input: Value) -> Result<Value, CodeRunError> {
                Err(CodeRunError("boom".into()))
            }
        }

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![step("A", StepAction::Code { source: "1".into() }, json!({}))],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({})).await;

        let mut step_deps = deps();
        step_deps.code_runner = Arc::new(FailingCodeRunner);
        let executor = WorkflowExecutor::new(store.clone(), scheduler, step_deps, &config());

        let outcome = executor.deliver(execution.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn parallel_group_merges_outputs_under_synthetic_key() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        let mut a = step("A", StepAction::Code { source: "1".into() }, json!(1));
        a.config = Some(StepConfig {
            for_each: None,
            parallel: Some(ParallelConfig {
                group: "g1".into(),
                mode: ParallelGroupMode::All,
            }),
        });
        let mut b = step("B", StepAction::Code { source: "1".into() }, json!(2));
        b.config = Some(StepConfig {
            for_each: None,
            parallel: Some(ParallelConfig {
                group: "g1".into(),
                mode: ParallelGroupMode::All,
            }),
        });

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![a, b],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({})).await;
        let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());
        let outcome = executor.deliver(execution.id).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed { output } => assert_eq!(output, json!(2)),
            other => panic!("expected Completed, got {other:?}"),
        }

        let a_row = store.get_step_result(execution.id, "A").await.unwrap().unwrap();
        assert_eq!(a_row.output, Some(json!(1)));
    }

    #[tokio::test]
    async fn for_each_step_fans_out_and_collects_values() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        let mut f = step("F", StepAction::Code { source: "1".into() }, json!("@item"));
        f.config = Some(StepConfig {
            for_each: Some(ForEachConfig {
                items: json!("@input.xs"),
                mode: crate::workflow::ForEachMode::Sequential,
                max_concurrency: None,
            }),
            parallel: None,
        });

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![f],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({"xs": [1, 2, 3]})).await;
        let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());
        let outcome = executor.deliver(execution.id).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed { output } => assert_eq!(output, json!([1, 2, 3])),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_execution_is_reported_without_running_steps() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = Arc::new(QueueScheduler::new());

        store.insert_workflow(WorkflowDefinition {
            id: "wf".into(),
            title: "wf".into(),
            description: None,
            steps: vec![step("A", StepAction::Code { source: "1".into() }, json!({}))],
            triggers: vec![],
        });

        let execution = new_execution(&store, "wf", json!({})).await;
        store.cancel_execution(execution.id).await.unwrap();

        let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());
        let outcome = executor.deliver(execution.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
        assert!(store.get_step_result(execution.id, "A").await.unwrap().is_none());
    }
}
