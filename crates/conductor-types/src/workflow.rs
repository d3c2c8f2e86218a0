use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::{ActionType, Platform, Priority};

/// Recipe for reversing a step's external effect. The engine merges the
/// executed step's external id into `params` when it builds the
/// compensating action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationSpec {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: Value,
}

/// One step of a workflow. Steps with no inter-dependency may run
/// concurrently; `depends_on` names must complete first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub platform: Platform,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_compensate: Option<CompensationSpec>,
    /// Whether re-driving this step after a crash is safe. Non-idempotent
    /// steps are failed instead of resumed on recovery.
    #[serde(default = "default_true")]
    pub idempotent: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_chain: Vec<Platform>,
}

fn default_true() -> bool {
    true
}

/// A multi-step workflow submission, owned by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub workflow_id: String,
    #[serde(default)]
    pub correlation_id: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub transactional: bool,
    pub steps: Vec<StepSpec>,
}

/// Terminal and intermediate workflow states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    PartiallyRolledBack,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::RolledBack => "rolled-back",
            WorkflowStatus::PartiallyRolledBack => "partially-rolled-back",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }
}
