use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::Platform;
use crate::error::ErrorKind;

/// Outcome of one attempt against one platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    Transient,
    Permanent,
    Timeout,
    RejectedByBreaker,
}

/// One in-flight or finished attempt, owned by the executor pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionAttempt {
    pub attempt_number: u32,
    pub platform: Platform,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Terminal disposition of a single action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Failed,
    PendingApproval,
    Rejected,
}

/// Final result of running one action through the executor pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_id: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Platform of the last attempt, fallback or primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_platform: Option<Platform>,
    #[serde(default)]
    pub attempts: u32,
    /// True when this result was served from the idempotency guard rather
    /// than a fresh external call.
    #[serde(default)]
    pub deduplicated: bool,
    /// Id of the decision whose execution produced the shared result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_action_id: Option<String>,
}

impl ActionResult {
    pub fn ok(action_id: impl Into<String>, platform: Platform) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Ok,
            value: None,
            external_id: None,
            error_kind: None,
            message: None,
            platform: Some(platform),
            used_fallback: false,
            fallback_platform: None,
            attempts: 0,
            deduplicated: false,
            origin_action_id: None,
        }
    }

    pub fn failed(
        action_id: impl Into<String>,
        platform: Platform,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Failed,
            value: None,
            external_id: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            platform: Some(platform),
            used_fallback: false,
            fallback_platform: None,
            attempts: 0,
            deduplicated: false,
            origin_action_id: None,
        }
    }

    pub fn rejected(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Rejected,
            value: None,
            external_id: None,
            error_kind: Some(ErrorKind::Validation),
            message: Some(reason.into()),
            platform: None,
            used_fallback: false,
            fallback_platform: None,
            attempts: 0,
            deduplicated: false,
            origin_action_id: None,
        }
    }

    pub fn pending_approval(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::PendingApproval,
            value: None,
            external_id: None,
            error_kind: None,
            message: None,
            platform: None,
            used_fallback: false,
            fallback_platform: None,
            attempts: 0,
            deduplicated: false,
            origin_action_id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ActionStatus::Ok
    }

    /// Re-key a cached result for a joining caller, marking the copy as
    /// deduplicated and remembering which decision actually executed.
    pub fn deduplicated_for(&self, action_id: &str) -> Self {
        let mut copy = self.clone();
        copy.origin_action_id = Some(self.action_id.clone());
        copy.action_id = action_id.to_string();
        copy.deduplicated = true;
        copy
    }
}
