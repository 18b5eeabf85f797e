//! Phase computation: groups steps into dependency-ordered, parallel-eligible levels
//!
//! Builds a dependency graph from `@`-references in each step's templated
//! fields, then computes levels via a Kahn's-algorithm-style topological
//! sort: level 0 is every step with no (known) step dependencies; level N+1
//! is every step whose dependencies are all in levels <= N. Phases run
//! strictly in sequence; steps within a phase are eligible to run in
//! parallel, subject to any explicit `parallel.group` assignment.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::reference::extract_dependencies;
use crate::workflow::{ParallelGroupMode, Step, StepAction, WorkflowDefinition};

/// One level of the topological sort: step names with no mutual dependencies.
pub type Phase = Vec<String>;

/// A unit of work within a phase: either a lone step, or a named group of
/// steps sharing a `parallel.group` and execution mode.
#[derive(Debug, Clone)]
pub enum StepGroup<'a> {
    Single(&'a Step),
    Group {
        name: String,
        mode: ParallelGroupMode,
        steps: Vec<&'a Step>,
    },
}

/// Computes the full phase partition for a workflow's step sequence.
pub fn compute_phases(workflow: &WorkflowDefinition) -> Vec<Phase> {
    let known: HashSet<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();
    let order: Vec<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();

    let deps: HashMap<&str, HashSet<String>> = workflow
        .steps
        .iter()
        .map(|step| (step.name.as_str(), step_dependencies(step, &known)))
        .collect();

    let mut remaining: HashSet<&str> = known.clone();
    let mut resolved: HashSet<String> = HashSet::new();
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        let ready_unordered: HashSet<&str> = remaining
            .iter()
            .filter(|name| deps[*name].iter().all(|d| resolved.contains(d)))
            .copied()
            .collect();

        if ready_unordered.is_empty() {
            warn!(
                remaining = remaining.len(),
                "step dependency cycle detected; falling back to sequential order for the remainder"
            );
            for name in order.iter().filter(|n| remaining.contains(*n)) {
                phases.push(vec![name.to_string()]);
                resolved.insert(name.to_string());
            }
            remaining.clear();
            break;
        }

        // Preserve the workflow's authored order within a phase for determinism.
        let phase: Phase = order
            .iter()
            .filter(|name| ready_unordered.contains(*name))
            .map(|name| name.to_string())
            .collect();

        for name in &phase {
            remaining.remove(name.as_str());
            resolved.insert(name.clone());
        }
        phases.push(phase);
    }

    phases
}

fn step_dependencies(step: &Step, known: &HashSet<&str>) -> HashSet<String> {
    let mut deps = extract_dependencies(&step.input);

    match &step.action {
        StepAction::Sleep { sleep_ms, sleep_until } => {
            if let Some(t) = sleep_ms {
                deps.extend(extract_dependencies(t));
            }
            if let Some(t) = sleep_until {
                deps.extend(extract_dependencies(t));
            }
        }
        StepAction::Tool { .. } | StepAction::Code { .. } | StepAction::WaitForSignal { .. } => {}
    }

    if let Some(config) = &step.config {
        if let Some(for_each) = &config.for_each {
            deps.extend(extract_dependencies(&for_each.items));
        }
    }

    deps.retain(|name| known.contains(name.as_str()) && name != &step.name);
    deps
}

/// Partitions one phase's step names into lone steps and named parallel
/// groups, preserving the workflow's authored order.
pub fn group_steps<'a>(workflow: &'a WorkflowDefinition, phase: &Phase) -> Vec<StepGroup<'a>> {
    let mut groups: Vec<StepGroup<'a>> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();

    for name in phase {
        let Some(step) = workflow.step(name) else { continue };

        match step.config.as_ref().and_then(|c| c.parallel.as_ref()) {
            Some(parallel) => {
                if let Some(&idx) = group_index.get(&parallel.group) {
                    if let StepGroup::Group { steps, .. } = &mut groups[idx] {
                        steps.push(step);
                    }
                } else {
                    group_index.insert(parallel.group.clone(), groups.len());
                    groups.push(StepGroup::Group {
                        name: parallel.group.clone(),
                        mode: parallel.mode,
                        steps: vec![step],
                    });
                }
            }
            None => groups.push(StepGroup::Single(step)),
        }
    }

    groups
}
