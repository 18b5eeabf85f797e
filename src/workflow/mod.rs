//! Workflow definition types
//!
//! A workflow is pure data — a named graph of [`Step`]s connected by `@`
//! references — interpreted at runtime rather than a compiled state
//! machine. See [`crate::control_flow`] for phase computation and
//! [`crate::engine`] for the orchestration loop that drives a definition.

mod definition;
mod signal;

pub use definition::{
    ForEachConfig, ForEachMode, ParallelConfig, ParallelGroupMode, Step, StepAction, StepConfig,
    Trigger, WorkflowDefinition,
};
pub use signal::Signal;
