use std::collections::{HashMap, HashSet};

use conductor_types::StepSpec;

/// Pure dependency-resolution helpers over a workflow's step list. The
/// engine owns all mutable run state; the scheduler only answers questions.
pub struct StepScheduler;

impl StepScheduler {
    /// Steps whose dependencies are all complete and which are not already
    /// running, complete, or skipped.
    pub fn ready<'a>(
        steps: &'a [StepSpec],
        completed: &HashSet<String>,
        in_flight: &HashSet<String>,
        skipped: &HashSet<String>,
    ) -> Vec<&'a StepSpec> {
        steps
            .iter()
            .filter(|step| {
                !completed.contains(&step.name)
                    && !in_flight.contains(&step.name)
                    && !skipped.contains(&step.name)
                    && step.depends_on.iter().all(|dep| completed.contains(dep))
            })
            .collect()
    }

    /// Validate workflow structure before any step runs: names must be
    /// unique, every dependency must name a step, and the dependency graph
    /// must admit a topological order.
    pub fn validate(steps: &[StepSpec]) -> Result<(), WorkflowValidationError> {
        if steps.is_empty() {
            return Err(WorkflowValidationError::EmptyWorkflow);
        }

        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (pos, step) in steps.iter().enumerate() {
            if positions.insert(step.name.as_str(), pos).is_some() {
                return Err(WorkflowValidationError::DuplicateStepName {
                    name: step.name.clone(),
                });
            }
        }

        // Edge lists and in-degrees in one pass; an unknown dependency
        // fails here before any graph work happens.
        let mut pending_deps = vec![0usize; steps.len()];
        let mut unblocks: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (pos, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&dep_pos) = positions.get(dep.as_str()) else {
                    return Err(WorkflowValidationError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                pending_deps[pos] += 1;
                unblocks[dep_pos].push(pos);
            }
        }

        // Peel the graph from its dependency-free frontier. Anything left
        // with unresolved dependencies sits on or behind a cycle.
        let mut frontier: Vec<usize> = (0..steps.len())
            .filter(|&pos| pending_deps[pos] == 0)
            .collect();
        let mut ordered = 0usize;
        while let Some(pos) = frontier.pop() {
            ordered += 1;
            for &blocked in &unblocks[pos] {
                pending_deps[blocked] -= 1;
                if pending_deps[blocked] == 0 {
                    frontier.push(blocked);
                }
            }
        }

        if ordered < steps.len() {
            let stuck = steps
                .iter()
                .enumerate()
                .filter(|&(pos, _)| pending_deps[pos] > 0)
                .map(|(_, step)| step.name.clone())
                .collect();
            return Err(WorkflowValidationError::CycleDetected { steps: stuck });
        }

        Ok(())
    }
}

/// Workflow structure errors, surfaced at submission before any side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowValidationError {
    EmptyWorkflow,
    DuplicateStepName { name: String },
    UnknownDependency { step: String, dependency: String },
    CycleDetected { steps: Vec<String> },
}

impl std::fmt::Display for WorkflowValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "workflow has no steps"),
            Self::DuplicateStepName { name } => {
                write!(f, "step name '{}' is used more than once", name)
            }
            Self::UnknownDependency { step, dependency } => {
                write!(f, "step '{}' depends on unknown step '{}'", step, dependency)
            }
            Self::CycleDetected { steps } => {
                write!(f, "steps caught in a dependency cycle: {}", steps.join(", "))
            }
        }
    }
}

impl std::error::Error for WorkflowValidationError {}
