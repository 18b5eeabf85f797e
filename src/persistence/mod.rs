//! Persistence layer: the [`ExecutionStore`]/[`WorkflowRepository`] traits
//! plus an in-memory implementation for tests and a Postgres implementation
//! for production.

mod memory;
mod postgres;
mod retry_decorator;
mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use retry_decorator::with_db_retry;
pub use store::{
    ExecutionStore, ListExecutionsFilter, StepResultPatch, StepResultSlot, StoreError,
    WorkflowRepository,
};
