//! Tool-invocation interface: calls an external integration connection

use async_trait::async_trait;
use serde_json::Value;

/// A tool's raw response before the Tool/structuredContent/content/raw
/// unwrapping the spec prescribes.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub structured_content: Option<Value>,
    pub content: Option<Value>,
    pub raw: Value,
}

impl ToolResponse {
    pub fn raw(value: Value) -> Self {
        Self {
            structured_content: None,
            content: None,
            raw: value,
        }
    }

    /// Unwraps in the prescribed order: `structuredContent`, then `content`,
    /// then the raw value.
    pub fn unwrap_output(self) -> Value {
        self.structured_content.or(self.content).unwrap_or(self.raw)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolInvokeError {
    #[error("tool invocation failed (status {status}): {message}")]
    Http { status: u16, message: String },
    #[error("{0}")]
    Other(String),
}

impl ToolInvokeError {
    /// Retryable iff the underlying status is `429` or `5xx`.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Other(_) => false,
        }
    }
}

/// Invokes a named tool on a connection. Implementations own the actual
/// transport (HTTP, gRPC, in-process); this crate only needs the contract.
#[async_trait]
pub trait ToolInvoker: Send + Sync + 'static {
    async fn invoke(
        &self,
        connection_id: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<ToolResponse, ToolInvokeError>;
}
