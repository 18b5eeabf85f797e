//! Top-level workflow orchestration (spec.md §4.6)
//!
//! `WorkflowExecutor::deliver` is the single entry point a scheduler re-entry
//! (or the initial `processEnqueued` pickup) calls into. Everything else in
//! this crate — the reference resolver, the step dispatcher, the control-flow
//! phase computation, the lock manager, trigger fan-out — is assembled here
//! into one delivery.

mod executor;

pub use executor::WorkflowExecutor;
