//! Trigger fan-out (`SPEC_FULL.md` §4.7)
//!
//! Fires after a workflow completes successfully. Failures here never
//! un-complete the parent — they're folded into the completion result the
//! caller reports.

use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::execution::NewExecution;
use crate::persistence::ExecutionStore;
use crate::reference::{resolve_template, RefContext};
use crate::scheduler::{ReentryContext, Scheduler};
use crate::step::coerce_items;
use crate::workflow::Trigger;

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Triggered { child_execution_ids: Vec<Uuid> },
    Skipped { reason: String },
    Failed { reason: String },
}

/// Fires every trigger in `triggers` against the workflow's finalized
/// output context, returning one outcome per trigger in order.
#[instrument(skip(store, scheduler, triggers, ctx, runtime_context), fields(parent_execution_id = %parent_execution_id))]
pub async fn fire_triggers<S, Sch>(
    store: &S,
    scheduler: &Sch,
    triggers: &[Trigger],
    parent_execution_id: Uuid,
    ctx: &RefContext<'_>,
    runtime_context: Option<Value>,
    foreach_hard_cap: usize,
) -> Vec<TriggerOutcome>
where
    S: ExecutionStore + ?Sized,
    Sch: Scheduler + ?Sized,
{
    let mut outcomes = Vec::with_capacity(triggers.len());
    for trigger in triggers {
        let outcome = fire_one(
            store,
            scheduler,
            trigger,
            parent_execution_id,
            ctx,
            runtime_context.clone(),
            foreach_hard_cap,
        )
        .await;
        if let TriggerOutcome::Failed { reason } = &outcome {
            warn!(workflow_id = %trigger.workflow_id, %reason, "trigger fan-out failed");
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn fire_one<S, Sch>(
    store: &S,
    scheduler: &Sch,
    trigger: &Trigger,
    parent_execution_id: Uuid,
    ctx: &RefContext<'_>,
    runtime_context: Option<Value>,
    foreach_hard_cap: usize,
) -> TriggerOutcome
where
    S: ExecutionStore + ?Sized,
    Sch: Scheduler + ?Sized,
{
    match &trigger.for_each {
        None => {
            let resolved = resolve_template(&trigger.input, ctx);
            if !resolved.ok() {
                return TriggerOutcome::Skipped {
                    reason: format!("unresolved references: {:?}", resolved.errors),
                };
            }
            match spawn_child(
                store,
                scheduler,
                trigger.workflow_id.clone(),
                resolved.value,
                parent_execution_id,
                runtime_context,
            )
            .await
            {
                Ok(id) => TriggerOutcome::Triggered {
                    child_execution_ids: vec![id],
                },
                Err(e) => TriggerOutcome::Failed { reason: e.to_string() },
            }
        }

        Some(for_each) => {
            let items_resolved = resolve_template(&for_each.items, ctx);
            if !items_resolved.ok() {
                return TriggerOutcome::Skipped {
                    reason: format!("unresolved forEach items: {:?}", items_resolved.errors),
                };
            }
            let Some(items) = coerce_items(&items_resolved.value) else {
                return TriggerOutcome::Failed {
                    reason: "forEach items did not resolve to an array".into(),
                };
            };

            if items.is_empty() {
                return TriggerOutcome::Triggered {
                    child_execution_ids: vec![],
                };
            }
            if items.len() > foreach_hard_cap {
                return TriggerOutcome::Failed {
                    reason: format!(
                        "forEach produced {} items, exceeding the hard cap of {foreach_hard_cap}",
                        items.len()
                    ),
                };
            }

            let mut child_execution_ids = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let iteration_ctx = ctx.with_iteration(item.clone(), index);
                let resolved = resolve_template(&trigger.input, &iteration_ctx);
                if !resolved.ok() {
                    return TriggerOutcome::Failed {
                        reason: format!("item {index} failed to resolve: {:?}", resolved.errors),
                    };
                }
                match spawn_child(
                    store,
                    scheduler,
                    trigger.workflow_id.clone(),
                    resolved.value,
                    parent_execution_id,
                    runtime_context.clone(),
                )
                .await
                {
                    Ok(id) => child_execution_ids.push(id),
                    Err(e) => return TriggerOutcome::Failed { reason: e.to_string() },
                }
            }
            TriggerOutcome::Triggered { child_execution_ids }
        }
    }
}

async fn spawn_child<S, Sch>(
    store: &S,
    scheduler: &Sch,
    workflow_id: String,
    input: Value,
    parent_execution_id: Uuid,
    runtime_context: Option<Value>,
) -> Result<Uuid, crate::persistence::StoreError>
where
    S: ExecutionStore + ?Sized,
    Sch: Scheduler + ?Sized,
{
    let execution = store
        .create_execution(NewExecution {
            workflow_id,
            input,
            timeout_ms: None,
            start_at_epoch_ms: None,
            parent_execution_id: Some(parent_execution_id),
            runtime_context: runtime_context.clone(),
            created_by: None,
        })
        .await?;

    // Best-effort immediate scheduling; `processEnqueued` picks it up
    // regardless if the scheduler is unavailable.
    let _ = scheduler
        .schedule_after(
            execution.id,
            std::time::Duration::from_millis(0),
            ReentryContext {
                runtime_context,
                retry_count: 0,
            },
        )
        .await;

    Ok(execution.id)
}
