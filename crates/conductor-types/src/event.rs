use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::decision::{ActionDecision, Platform, Priority};
use crate::error::ErrorKind;
use crate::workflow::{WorkflowSpec, WorkflowStatus};

/// Snapshot of a circuit breaker's counters, attached to every transition
/// event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BreakerCounters {
    pub consecutive_failures: u32,
    pub window_len: usize,
    pub half_open_successes: u32,
}

/// Discriminated sum of every event on the orchestrator's bus, inbound and
/// outbound. Subscribers match on the subset they handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "action:ready")]
    ActionReady { decision: ActionDecision },
    #[serde(rename = "workflow:submit")]
    WorkflowSubmit { spec: WorkflowSpec },
    #[serde(rename = "action:queued")]
    ActionQueued {
        action_id: String,
        priority: Priority,
    },
    #[serde(rename = "action:started")]
    ActionStarted {
        action_id: String,
        platform: Platform,
        attempt: u32,
    },
    #[serde(rename = "action:retrying")]
    ActionRetrying {
        action_id: String,
        attempt: u32,
        delay_ms: u64,
        error_kind: ErrorKind,
    },
    #[serde(rename = "action:completed")]
    ActionCompleted {
        action_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
        used_fallback: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_platform: Option<Platform>,
    },
    #[serde(rename = "action:failed")]
    ActionFailed {
        action_id: String,
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<Platform>,
        fallback_attempted: bool,
    },
    #[serde(rename = "action:requires_approval")]
    ActionRequiresApproval {
        action_id: String,
        review_id: String,
        reason: String,
        timeout_at: DateTime<Utc>,
    },
    #[serde(rename = "action:rejected")]
    ActionRejected { action_id: String, reason: String },
    #[serde(rename = "circuit:opened")]
    CircuitOpened {
        platform: Platform,
        counters: BreakerCounters,
    },
    #[serde(rename = "circuit:closed")]
    CircuitClosed {
        platform: Platform,
        counters: BreakerCounters,
    },
    #[serde(rename = "circuit:half-open")]
    CircuitHalfOpen {
        platform: Platform,
        counters: BreakerCounters,
    },
    #[serde(rename = "workflow:step_completed")]
    WorkflowStepCompleted {
        workflow_id: String,
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    #[serde(rename = "workflow:rollback_started")]
    WorkflowRollbackStarted {
        workflow_id: String,
        failed_step: String,
    },
    #[serde(rename = "workflow:rolled_back")]
    WorkflowRolledBack { workflow_id: String },
    #[serde(rename = "workflow:rollback_failed")]
    WorkflowRollbackFailed { workflow_id: String, step: String },
    #[serde(rename = "workflow:finished")]
    WorkflowFinished {
        workflow_id: String,
        status: WorkflowStatus,
    },
}

impl EventPayload {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ActionReady { .. } => "action:ready",
            EventPayload::WorkflowSubmit { .. } => "workflow:submit",
            EventPayload::ActionQueued { .. } => "action:queued",
            EventPayload::ActionStarted { .. } => "action:started",
            EventPayload::ActionRetrying { .. } => "action:retrying",
            EventPayload::ActionCompleted { .. } => "action:completed",
            EventPayload::ActionFailed { .. } => "action:failed",
            EventPayload::ActionRequiresApproval { .. } => "action:requires_approval",
            EventPayload::ActionRejected { .. } => "action:rejected",
            EventPayload::CircuitOpened { .. } => "circuit:opened",
            EventPayload::CircuitClosed { .. } => "circuit:closed",
            EventPayload::CircuitHalfOpen { .. } => "circuit:half-open",
            EventPayload::WorkflowStepCompleted { .. } => "workflow:step_completed",
            EventPayload::WorkflowRollbackStarted { .. } => "workflow:rollback_started",
            EventPayload::WorkflowRolledBack { .. } => "workflow:rolled_back",
            EventPayload::WorkflowRollbackFailed { .. } => "workflow:rollback_failed",
            EventPayload::WorkflowFinished { .. } => "workflow:finished",
        }
    }

    /// Suggested delivery priority for downstream consumers.
    pub fn delivery_priority(&self) -> Priority {
        match self {
            EventPayload::ActionRetrying { .. } => Priority::Low,
            EventPayload::ActionFailed { .. }
            | EventPayload::ActionRequiresApproval { .. }
            | EventPayload::CircuitOpened { .. }
            | EventPayload::CircuitClosed { .. }
            | EventPayload::CircuitHalfOpen { .. }
            | EventPayload::WorkflowRollbackStarted { .. }
            | EventPayload::WorkflowRolledBack { .. }
            | EventPayload::WorkflowRollbackFailed { .. } => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Envelope carried on the bus: every event is stamped, sourced, and
/// threaded with the correlation id of the originating decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: String,
    pub delivery: Priority,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl OrchestratorEvent {
    pub fn new(correlation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: "orchestrator".to_string(),
            correlation_id: correlation_id.into(),
            delivery: payload.delivery_priority(),
            payload,
        }
    }
}
