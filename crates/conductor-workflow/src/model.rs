use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_types::{ActionResult, ActionType, Platform, WorkflowStatus};

/// A compensator registered when a step succeeds. Plain data rather than a
/// closure so rollback state can be journaled and rebuilt after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensator {
    pub step: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Outcome of one executed compensator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationOutcome {
    pub step: String,
    pub result: ActionResult,
}

/// One execution of a [`conductor_types::WorkflowSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub correlation_id: String,
    pub status: WorkflowStatus,
    pub completed_steps: Vec<String>,
    pub step_results: HashMap<String, ActionResult>,
    /// LIFO: last successful step's compensator sits at the back.
    pub rollback_stack: Vec<Compensator>,
    pub compensation_results: Vec<CompensationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
}

impl WorkflowRun {
    pub fn new(workflow_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            correlation_id: correlation_id.into(),
            status: WorkflowStatus::Pending,
            completed_steps: Vec::new(),
            step_results: HashMap::new(),
            rollback_stack: Vec::new(),
            compensation_results: Vec::new(),
            failed_step: None,
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
        }
    }

    pub fn record_success(&mut self, step: &str, result: ActionResult) {
        self.completed_steps.push(step.to_string());
        self.step_results.insert(step.to_string(), result);
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_success_tracks_completion_order() {
        let mut run = WorkflowRun::new("wf-1", "sig-1");
        run.record_success("A", ActionResult::ok("wf-1:A", Platform::Drive));
        run.record_success("B", ActionResult::ok("wf-1:B", Platform::Sheets));
        assert_eq!(run.completed_steps, vec!["A".to_string(), "B".to_string()]);
        assert!(run.step_results.contains_key("A"));
    }

    #[test]
    fn finish_stamps_terminal_state() {
        let mut run = WorkflowRun::new("wf-1", "sig-1");
        run.finish(WorkflowStatus::RolledBack);
        assert_eq!(run.status, WorkflowStatus::RolledBack);
        assert!(run.finished_at.is_some());
        assert!(run.status.is_terminal());
    }
}
