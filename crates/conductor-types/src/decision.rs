use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch priority of an action. Lower `rank()` is served first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Queue lane index: 0 is served first.
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_rank(rank: usize) -> Option<Priority> {
        Priority::ALL.get(rank).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// True if `self` is served before `other`.
    pub fn outranks(self, other: Priority) -> bool {
        self.rank() < other.rank()
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Closed set of external platforms an action can target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Notion,
    Trello,
    Slack,
    Drive,
    Sheets,
    Gmail,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Notion,
        Platform::Trello,
        Platform::Slack,
        Platform::Drive,
        Platform::Sheets,
        Platform::Gmail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Notion => "notion",
            Platform::Trello => "trello",
            Platform::Slack => "slack",
            Platform::Drive => "drive",
            Platform::Sheets => "sheets",
            Platform::Gmail => "gmail",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "notion" => Ok(Platform::Notion),
            "trello" => Ok(Platform::Trello),
            "slack" => Ok(Platform::Slack),
            "drive" => Ok(Platform::Drive),
            "sheets" => Ok(Platform::Sheets),
            "gmail" => Ok(Platform::Gmail),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator for what an action does. The router validates the parameter
/// shape it needs for admission; adapters interpret the rest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateTask,
    UpdateTask,
    Notify,
    FileDocument,
    AppendRow,
    Log,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateTask => "create_task",
            ActionType::UpdateTask => "update_task",
            ActionType::Notify => "notify",
            ActionType::FileDocument => "file_document",
            ActionType::AppendRow => "append_row",
            ActionType::Log => "log",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative action decision produced by the upstream reasoning
/// component. Treated as an opaque instruction apart from routing fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDecision {
    pub id: String,
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub platform: Platform,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_chain: Vec<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Set by the approval coordinator when a human (or the timeout path)
    /// approved this decision before resubmission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// When set, this decision reverses an earlier effect: the adapter's
    /// `compensate` entry point is called with this external id instead of
    /// `execute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates_external_id: Option<String>,
}

/// Lifecycle state of an admitted action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Accepted,
    Queued,
    Running,
    Retrying,
    PendingApproval,
    Succeeded,
    Failed,
    Rejected,
}
