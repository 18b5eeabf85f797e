//! Durable workflow engine entrypoint
//!
//! Drives re-entries from the in-process [`QueueScheduler`] against a
//! Postgres-backed [`ExecutionStore`]. Mirrors the lineage's
//! `everruns-worker/src/main.rs`: `dotenvy` loads a local `.env` before
//! `EngineConfig::from_env`, `tracing-subscriber` is configured once here
//! (library code never touches the subscriber), and the top-level `Result`
//! is `anyhow`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use durable_workflow::persistence::{ExecutionStore, PostgresExecutionStore};
use durable_workflow::reliability::RetryPolicy;
use durable_workflow::scheduler::{QueueScheduler, ReentryContext, Scheduler};
use durable_workflow::step::{CodeRunError, CodeRunner, StepDeps, ToolInvokeError, ToolInvoker, ToolResponse};
use durable_workflow::{EngineConfig, ExecutionOutcome, WorkflowExecutor};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// No integration backend is wired up by default; operators implement
/// [`ToolInvoker`] against their own connection/credential store and pass it
/// into [`WorkflowExecutor::new`] in place of this stub.
struct UnimplementedToolInvoker;

#[async_trait::async_trait]
impl ToolInvoker for UnimplementedToolInvoker {
    async fn invoke(
        &self,
        _connection_id: &str,
        _tool_name: &str,
        _input: Value,
    ) -> Result<ToolResponse, ToolInvokeError> {
        Err(ToolInvokeError::Other("no ToolInvoker configured".into()))
    }
}

struct UnimplementedCodeRunner;

#[async_trait::async_trait]
impl CodeRunner for UnimplementedCodeRunner {
    async fn run(&self, _source: &str, _input: Value) -> Result<Value, CodeRunError> {
        Err(CodeRunError("no CodeRunner configured".into()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durable_workflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("durable-workflow engine starting...");

    let config = EngineConfig::from_env().context("loading EngineConfig")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    tracing::info!("database connection established");

    let db_retry_policy = RetryPolicy::exponential()
        .with_max_attempts(config.db_retry_max_attempts)
        .with_initial_interval(config.db_retry_initial)
        .with_max_interval(config.db_retry_max);
    let store = Arc::new(PostgresExecutionStore::with_retry_policy(pool, db_retry_policy));
    let scheduler = Arc::new(QueueScheduler::new());
    let step_deps = StepDeps {
        tool_invoker: Arc::new(UnimplementedToolInvoker),
        code_runner: Arc::new(UnimplementedCodeRunner),
        sleep_inline_threshold: config.sleep_inline_threshold,
    };
    let executor = Arc::new(WorkflowExecutor::new(
        store.clone(),
        scheduler.clone(),
        step_deps,
        &config,
    ));

    // Pick up anything left enqueued from before a restart; the scheduler
    // queue itself is in-memory and empty on a fresh process.
    match store.process_enqueued().await {
        Ok(ids) => {
            for id in ids {
                let _ = scheduler
                    .schedule_after(id, Duration::from_millis(0), ReentryContext::default())
                    .await;
            }
        }
        Err(error) => tracing::warn!(%error, "failed to scan for enqueued executions"),
    }

    tracing::info!("engine ready");

    loop {
        tokio::select! {
            job = scheduler.next_ready() => {
                let Some(job) = job else { continue };
                let executor = executor.clone();
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let execution_id = job.execution_id;
                    match executor.deliver(execution_id).await {
                        Ok(ExecutionOutcome::NeedsRetry { delay, retry_count }) => {
                            tracing::debug!(%execution_id, ?delay, retry_count, "execution needs retry");
                            let _ = scheduler
                                .schedule_after(execution_id, delay, ReentryContext { retry_count, ..job.ctx })
                                .await;
                        }
                        Ok(ExecutionOutcome::Sleeping { wake_at_epoch_ms }) => {
                            tracing::debug!(%execution_id, wake_at_epoch_ms, "execution sleeping");
                            let _ = scheduler
                                .schedule_at(execution_id, wake_at_epoch_ms, job.ctx)
                                .await;
                        }
                        Ok(ExecutionOutcome::WaitingForSignal {
                            timeout_at_epoch_ms: Some(timeout_at_epoch_ms),
                            ..
                        }) => {
                            let _ = scheduler.schedule_at(execution_id, timeout_at_epoch_ms, job.ctx).await;
                        }
                        Ok(outcome) => {
                            tracing::info!(%execution_id, status = outcome.status_label(), "delivery finished");
                        }
                        Err(error) => {
                            tracing::error!(%execution_id, %error, "delivery failed");
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
