//! Code-step interface: runs inline source through an opaque code runner

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
#[error("code step failed: {0}")]
pub struct CodeRunError(pub String);

/// Executes a step's `source` with the resolved input; any non-success
/// outcome fails the step (spec.md §4.4 treats code failures as fatal, not
/// retryable — there is no transport layer to retry against).
#[async_trait]
pub trait CodeRunner: Send + Sync + 'static {
    async fn run(&self, source: &str, input: Value) -> Result<Value, CodeRunError>;
}
