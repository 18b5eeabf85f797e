//! # Durable Workflow Engine
//!
//! A relational-store-backed workflow orchestration engine. A workflow is
//! pure data — a named graph of steps connected by `@`-style references —
//! interpreted at runtime rather than compiled into a state machine.
//!
//! ## Features
//!
//! - **Declarative step graphs**: workflows are JSON, not code; control flow
//!   (`forEach`, parallel groups, phases) is computed from step dependencies
//! - **Durable suspension**: `sleep` and `waitForSignal` steps persist and
//!   resume via a [`scheduler::Scheduler`] re-entry rather than blocking a
//!   worker
//! - **Automatic retries**: exponential backoff with jitter for transient
//!   database and step failures
//! - **Trigger fan-out**: a completed workflow can spawn child executions,
//!   including one per `forEach` item
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │   (one `deliver` call = one phase-by-phase pass over a        │
//! │    workflow's step graph, resuming where the last left off)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!     control_flow/step   reference        persistence
//!   (phases, dispatch,   (@-reference    (ExecutionStore,
//!    forEach, locking)    resolution)     Postgres/memory)
//!                              │
//!                              ▼
//!                          scheduler
//!              (re-entry: in-process queue or webhook)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_workflow::prelude::*;
//!
//! async fn deliver_one(executor: &WorkflowExecutor<impl ExecutionStore + WorkflowRepository, impl Scheduler>, execution_id: uuid::Uuid) {
//!     match executor.deliver(execution_id).await {
//!         Ok(ExecutionOutcome::Completed { output }) => println!("done: {output}"),
//!         Ok(other) => println!("not yet done: {other:?}"),
//!         Err(e) => eprintln!("delivery failed: {e}"),
//!     }
//! }
//! ```

pub mod config;
pub mod control_flow;
pub mod engine;
pub mod error;
pub mod execution;
pub mod lock;
pub mod persistence;
pub mod reference;
pub mod reliability;
pub mod scheduler;
pub mod step;
pub mod trigger;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::engine::WorkflowExecutor;
    pub use crate::error::ExecutorError;
    pub use crate::execution::{ExecutionOutcome, ExecutionStatus, StepResult, WorkflowExecution};
    pub use crate::persistence::{
        ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, WorkflowRepository,
    };
    pub use crate::reference::RefContext;
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{QueueScheduler, Scheduler};
    pub use crate::step::{CodeRunner, StepDeps, ToolInvoker};
    pub use crate::workflow::{Step, StepAction, WorkflowDefinition};
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use engine::WorkflowExecutor;
pub use error::ExecutorError;
pub use execution::{ExecutionOutcome, ExecutionStatus, WorkflowExecution};
pub use persistence::{
    ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError, WorkflowRepository,
};
pub use reliability::RetryPolicy;
pub use scheduler::{QueueScheduler, Scheduler};
pub use workflow::{Step, StepAction, WorkflowDefinition};
