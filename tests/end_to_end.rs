//! End-to-end coverage of `WorkflowExecutor::deliver` against the
//! in-memory store and queue scheduler, driving whole workflows the way a
//! production deployment would rather than unit-testing individual modules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use durable_workflow::persistence::{ExecutionStore, InMemoryExecutionStore};
use durable_workflow::scheduler::{QueueScheduler, ReentryContext, Scheduler};
use durable_workflow::step::{CodeRunError, CodeRunner, StepDeps, ToolInvokeError, ToolInvoker, ToolResponse};
use durable_workflow::workflow::{
    ForEachConfig, ForEachMode, ParallelConfig, ParallelGroupMode, Signal, Step, StepAction, StepConfig, Trigger,
    WorkflowDefinition,
};
use durable_workflow::{EngineConfig, ExecutionOutcome, ExecutorError, WorkflowExecutor};
use serde_json::json;

struct EchoCodeRunner;

#[async_trait]
impl CodeRunner for EchoCodeRunner {
    async fn run(&self, _source: &str, input: serde_json::Value) -> Result<serde_json::Value, CodeRunError> {
        Ok(input)
    }
}

struct NoopToolInvoker;

#[async_trait]
impl ToolInvoker for NoopToolInvoker {
    async fn invoke(
        &self,
        _connection_id: &str,
        _tool_name: &str,
        input: serde_json::Value,
    ) -> Result<ToolResponse, ToolInvokeError> {
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

fn step(name: &str, action: StepAction, input: serde_json::Value) -> Step {
    Step {
        name: name.to_string(),
        action,
        input,
        config: None,
        max_iterations: None,
        exclude_from_workflow_output: false,
    }
}

async fn new_execution(
    store: &InMemoryExecutionStore,
    workflow_id: &str,
    input: serde_json::Value,
) -> durable_workflow::execution::WorkflowExecution {
    use durable_workflow::execution::NewExecution;
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
async fn multi_phase_workflow_threads_step_references_across_phases() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    store.insert_workflow(WorkflowDefinition {
        id: "order-pipeline".into(),
        title: "order pipeline".into(),
        description: None,
        steps: vec![
            step("validate", StepAction::Code { source: "noop".into() }, json!({"orderId": "@input.orderId"})),
            step("charge", StepAction::Code { source: "noop".into() }, json!({"orderId": "@validate.orderId", "amount": "@input.amount"})),
            step("ship", StepAction::Code { source: "noop".into() }, json!({"orderId": "@validate.orderId", "charged": "@charge.amount"})),
        ],
        triggers: vec![],
    });

    let execution = new_execution(&store, "order-pipeline", json!({"orderId": "o-1", "amount": 42})).await;
    let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());

    let outcome = executor.deliver(execution.id).await.unwrap();
    match outcome {
        ExecutionOutcome::Completed { output } => {
            assert_eq!(output, json!({"orderId": "o-1", "charged": 42}));
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    for name in ["validate", "charge", "ship"] {
        let row = store.get_step_result(execution.id, name).await.unwrap().unwrap();
        assert!(row.is_completed());
    }
}

#[tokio::test]
async fn completed_workflow_fans_out_a_trigger_and_schedules_the_child() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    store.insert_workflow(WorkflowDefinition {
        id: "parent".into(),
        title: "parent".into(),
        description: None,
        steps: vec![step(
            "create-order",
            StepAction::Code { source: "noop".into() },
            json!({"orderId": "o-7"}),
        )],
        triggers: vec![Trigger {
            workflow_id: "send-receipt".into(),
            input: json!({"orderId": "@output.orderId"}),
            for_each: None,
        }],
    });
    store.insert_workflow(WorkflowDefinition {
        id: "send-receipt".into(),
        title: "send receipt".into(),
        description: None,
        steps: vec![],
        triggers: vec![],
    });

    let execution = new_execution(&store, "parent", json!({})).await;
    let executor = WorkflowExecutor::new(store.clone(), scheduler.clone(), deps(), &config());

    let outcome = executor.deliver(execution.id).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
    assert_eq!(scheduler.pending_count().await, 1);

    let job = scheduler.next_ready().await.unwrap();
    let child = store.get_execution(job.execution_id).await.unwrap().unwrap();
    assert_eq!(child.workflow_id, "send-receipt");
    assert_eq!(child.parent_execution_id, Some(execution.id));
    assert_eq!(child.input, json!({"orderId": "o-7"}));
}

#[tokio::test]
async fn durable_sleep_suspends_and_an_immediate_redelivery_reports_contention_as_retryable() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    store.insert_workflow(WorkflowDefinition {
        id: "wf".into(),
        title: "wf".into(),
        description: None,
        steps: vec![step(
            "pause",
            StepAction::Sleep {
                sleep_ms: Some(json!(3_600_000)),
                sleep_until: None,
            },
            json!({}),
        )],
        triggers: vec![],
    });

    let execution = new_execution(&store, "wf", json!({})).await;
    let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());

    let first = executor.deliver(execution.id).await.unwrap();
    assert!(matches!(first, ExecutionOutcome::Sleeping { .. }));

    let second = executor.deliver(execution.id).await.unwrap();
    assert!(matches!(second, ExecutionOutcome::NeedsRetry { .. }));
}

#[tokio::test]
async fn wait_for_signal_suspends_then_completes_once_a_signal_arrives() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    store.insert_workflow(WorkflowDefinition {
        id: "approval".into(),
        title: "approval".into(),
        description: None,
        steps: vec![
            step("request", StepAction::Code { source: "noop".into() }, json!({})),
            step(
                "await-approval",
                StepAction::WaitForSignal {
                    signal_name: "approved".into(),
                    timeout_ms: Some(60_000),
                },
                json!({}),
            ),
        ],
        triggers: vec![],
    });

    let execution = new_execution(&store, "approval", json!({})).await;
    let executor = WorkflowExecutor::new(store.clone(), scheduler, deps(), &config());

    let suspended = executor.deliver(execution.id).await.unwrap();
    match suspended {
        ExecutionOutcome::WaitingForSignal { signal_name, timeout_at_epoch_ms, .. } => {
            assert_eq!(signal_name, "approved");
            assert!(timeout_at_epoch_ms.is_some());
        }
        other => panic!("expected WaitingForSignal, got {other:?}"),
    }

    store
        .send_signal(Signal::new(execution.id, "approved", Some(json!({"by": "ada"}))))
        .await
        .unwrap();

    let resumed = executor.deliver(execution.id).await.unwrap();
    match resumed {
        ExecutionOutcome::Completed { output } => assert_eq!(output, json!({"by": "ada"})),
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn for_each_all_settled_reports_per_item_failures_without_failing_the_workflow() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    struct EveryThirdItemFails;
    #[async_trait]
    impl CodeRunner for EveryThirdItemFails {
        async fn run(&self, _source: &str, input: serde_json::Value) -> Result<serde_json::Value, CodeRunError> {
            match input.get("n").and_then(|n| n.as_i64()) {
                Some(n) if n % 3 == 0 => Err(CodeRunError(format!("item {n} rejected"))),
                _ => Ok(input),
            }
        }
    }

    let mut f = step("process", StepAction::Code { source: "noop".into() }, json!({"n": "@item"}));
    f.config = Some(StepConfig {
        for_each: Some(ForEachConfig {
            items: json!("@input.items"),
            mode: ForEachMode::AllSettled,
            max_concurrency: None,
        }),
        parallel: None,
    });

    store.insert_workflow(WorkflowDefinition {
        id: "batch".into(),
        title: "batch".into(),
        description: None,
        steps: vec![f],
        triggers: vec![],
    });

    let execution = new_execution(&store, "batch", json!({"items": [1, 2, 3, 4]})).await;

    let mut step_deps = deps();
    step_deps.code_runner = Arc::new(EveryThirdItemFails);
    let executor = WorkflowExecutor::new(store.clone(), scheduler, step_deps, &config());

    let outcome = executor.deliver(execution.id).await.unwrap();
    match outcome {
        ExecutionOutcome::Completed { output } => {
            let results = output.as_array().unwrap();
            assert_eq!(results.len(), 4);
            assert_eq!(results[2]["status"], json!("rejected"));
            assert_eq!(results[0]["status"], json!("fulfilled"));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn parallel_group_failure_fails_the_whole_execution() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    struct FailingCodeRunner;
    #[async_trait]
    impl CodeRunner for FailingCodeRunner {
        async fn run(&self, _source: &str, _input: serde_json::Value) -> Result<serde_json::Value, CodeRunError> {
            Err(CodeRunError("downstream outage".into()))
        }
    }

    let mut a = step("reserve-inventory", StepAction::Code { source: "noop".into() }, json!(1));
    a.config = Some(StepConfig {
        for_each: None,
        parallel: Some(ParallelConfig { group: "fulfillment".into(), mode: ParallelGroupMode::All }),
    });
    let mut b = step("charge-card", StepAction::Code { source: "noop".into() }, json!(2));
    b.config = Some(StepConfig {
        for_each: None,
        parallel: Some(ParallelConfig { group: "fulfillment".into(), mode: ParallelGroupMode::All }),
    });

    store.insert_workflow(WorkflowDefinition {
        id: "wf".into(),
        title: "wf".into(),
        description: None,
        steps: vec![a, b],
        triggers: vec![],
    });

    let execution = new_execution(&store, "wf", json!({})).await;

    let mut step_deps = deps();
    step_deps.code_runner = Arc::new(FailingCodeRunner);
    let executor = WorkflowExecutor::new(store.clone(), scheduler, step_deps, &config());

    let outcome = executor.deliver(execution.id).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
}

#[tokio::test]
async fn scheduler_driven_redelivery_completes_a_workflow_suspended_on_a_signal() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());

    store.insert_workflow(WorkflowDefinition {
        id: "wf".into(),
        title: "wf".into(),
        description: None,
        steps: vec![step(
            "wait",
            StepAction::WaitForSignal { signal_name: "go".into(), timeout_ms: None },
            json!({}),
        )],
        triggers: vec![],
    });

    let execution = new_execution(&store, "wf", json!({})).await;
    let executor = WorkflowExecutor::new(store.clone(), scheduler.clone(), deps(), &config());

    let first = executor.deliver(execution.id).await.unwrap();
    assert!(matches!(first, ExecutionOutcome::WaitingForSignal { .. }));

    store.send_signal(Signal::new(execution.id, "go", None)).await.unwrap();
    scheduler
        .schedule_after(execution.id, Duration::from_millis(5), ReentryContext::default())
        .await
        .unwrap();

    let job = scheduler.next_ready().await.unwrap();
    assert_eq!(job.execution_id, execution.id);

    let outcome = executor.deliver(job.execution_id).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
}

#[tokio::test]
async fn delivering_an_unknown_execution_is_a_not_found_error() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Arc::new(QueueScheduler::new());
    let executor = WorkflowExecutor::new(store, scheduler, deps(), &config());

    let result = executor.deliver(uuid::Uuid::now_v7()).await;
    assert!(matches!(result, Err(ExecutorError::NotFound(_))));
}
