//! Workflow, step, and trigger definitions
//!
//! Unlike the trait-based workflows this crate's lineage used to define,
//! a workflow here is pure data: a named graph of steps connected by `@`
//! references (see [`crate::reference`]), interpreted at runtime by the
//! [`crate::control_flow`] and [`crate::engine`] modules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative workflow: a flat, ordered sequence of steps plus the
/// triggers that fire on completion.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

/// On-the-wire shape, accepting both the flat `steps` form and the legacy
/// `{phases:[[step,...],...]}` nested form. Deserializing through this type
/// and flattening is cheaper than hand-rolling a `Deserialize` impl with a
/// visitor.
#[derive(Debug, Deserialize)]
struct WireWorkflowDefinition {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    phases: Vec<Vec<Step>>,
    #[serde(default)]
    triggers: Vec<Trigger>,
}

impl<'de> Deserialize<'de> for WorkflowDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireWorkflowDefinition::deserialize(deserializer)?;
        let steps = if wire.steps.is_empty() && !wire.phases.is_empty() {
            wire.phases.into_iter().flatten().collect()
        } else {
            wire.steps
        };
        Ok(WorkflowDefinition {
            id: wire.id,
            title: wire.title,
            description: wire.description,
            steps,
            triggers: wire.triggers,
        })
    }
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// One named unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    #[serde(default = "default_input")]
    pub input: Value,
    #[serde(default)]
    pub config: Option<StepConfig>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub exclude_from_workflow_output: bool,
}

fn default_input() -> Value {
    Value::Object(Default::default())
}

impl Step {
    /// `max_iterations`, defaulting per spec to 100 when unset.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations.unwrap_or(100)
    }
}

/// What kind of work a step performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Invoke an external tool through an integration connection.
    Tool {
        connection_id: String,
        tool_name: String,
    },
    /// Run inline code through the (opaque) code runner.
    Code { source: String },
    /// Pause for a duration or until a wall-clock time.
    ///
    /// Exactly one of `sleep_ms` / `sleep_until` is populated; both are
    /// reference templates (a duration or timestamp may itself be `@...`).
    Sleep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep_ms: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep_until: Option<Value>,
    },
    /// Block until a named signal arrives (or times out).
    WaitForSignal {
        signal_name: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Per-step execution configuration: iteration and parallel-group placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepConfig {
    #[serde(default)]
    pub for_each: Option<ForEachConfig>,
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,
}

/// `forEach` iteration over a resolved items array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForEachConfig {
    /// Reference template resolving to the items array.
    pub items: Value,
    pub mode: ForEachMode,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForEachMode {
    Sequential,
    Parallel,
    Race,
    AllSettled,
}

/// Named parallel-group placement: steps sharing a `group` run together
/// under the group's `mode`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelConfig {
    pub group: String,
    pub mode: ParallelGroupMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParallelGroupMode {
    All,
    Race,
    AllSettled,
}

/// A declarative, parameterized child-workflow invocation fired on parent
/// workflow completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub workflow_id: String,
    pub input: Value,
    #[serde(default)]
    pub for_each: Option<ForEachConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_legacy_phases_shape() {
        let wire = json!({
            "id": "wf1",
            "title": "Legacy",
            "phases": [
                [{"name": "A", "action": {"kind": "code", "source": "1"}, "input": {}}],
                [{"name": "B", "action": {"kind": "code", "source": "2"}, "input": {}}],
            ],
        });
        let def: WorkflowDefinition = serde_json::from_value(wire).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].name, "A");
        assert_eq!(def.steps[1].name, "B");
    }

    #[test]
    fn accepts_flat_steps_shape() {
        let wire = json!({
            "id": "wf1",
            "title": "Flat",
            "steps": [{"name": "A", "action": {"kind": "code", "source": "1"}, "input": {}}],
        });
        let def: WorkflowDefinition = serde_json::from_value(wire).unwrap();
        assert_eq!(def.steps.len(), 1);
    }

    #[test]
    fn step_default_max_iterations_is_100() {
        let step = Step {
            name: "F".into(),
            action: StepAction::Code { source: "x".into() },
            input: json!({}),
            config: None,
            max_iterations: None,
            exclude_from_workflow_output: false,
        };
        assert_eq!(step.max_iterations(), 100);
    }

    #[test]
    fn step_action_serde_tag() {
        let action = StepAction::WaitForSignal {
            signal_name: "approve".into(),
            timeout_ms: Some(1000),
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["kind"], json!("wait_for_signal"));
    }
}
