//! Signals: named external events delivered to a specific execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named external event delivered to one execution and consumed at most
/// once by at most one `waitForSignal` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub name: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn new(execution_id: Uuid, name: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            name: name.into(),
            payload,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_is_unconsumed() {
        let signal = Signal::new(Uuid::now_v7(), "approve", Some(serde_json::json!({"by": "u1"})));
        assert!(!signal.is_consumed());
        assert_eq!(signal.name, "approve");
    }
}
