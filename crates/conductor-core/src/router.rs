use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use conductor_types::{
    ActionAttempt, ActionDecision, ActionResult, ActionState, ActionType, EventPayload, Priority,
};

use crate::config::RouterConfig;
use crate::event_bus::EventBus;
use crate::journal::{Journal, JournalKind};
use crate::metrics::Metrics;
use crate::queue::{PriorityQueue, QueueFull};

/// Canonical per-action state. Created at admission, owned exclusively by
/// one worker after dequeue, destroyed after the terminal event.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub decision: ActionDecision,
    pub state: ActionState,
    pub attempts: Vec<ActionAttempt>,
    pub queue_enqueued_at: DateTime<Utc>,
    pub first_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
    pub last_error: Option<String>,
}

impl ActionRecord {
    pub fn new(decision: ActionDecision) -> Self {
        Self {
            decision,
            state: ActionState::Accepted,
            attempts: Vec::new(),
            queue_enqueued_at: Utc::now(),
            first_started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
        }
    }

    pub fn priority(&self) -> Priority {
        self.decision.priority
    }
}

/// Why the router refused a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    Validation(String),
    QueueFull,
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(reason) => write!(f, "validation: {reason}"),
            Self::QueueFull => write!(f, "queue_full"),
        }
    }
}

impl std::error::Error for AdmitError {}

/// Validates incoming decisions, pins their priority and idempotency key,
/// and admits them to the queue. Malformed input is rejected here with a
/// `validation` error that never touches the breaker.
pub struct ActionRouter {
    queue: Arc<PriorityQueue>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    journal: Option<Arc<Journal>>,
    config: RouterConfig,
}

impl ActionRouter {
    pub fn new(
        queue: Arc<PriorityQueue>,
        bus: EventBus,
        metrics: Arc<Metrics>,
        journal: Option<Arc<Journal>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            queue,
            bus,
            metrics,
            journal,
            config,
        }
    }

    /// Validate and enqueue one decision. Emits `action:queued` on
    /// admission and `action:rejected` on refusal or eviction.
    pub fn submit(&self, mut decision: ActionDecision) -> Result<(), AdmitError> {
        if let Err(reason) = validate_params(&decision) {
            warn!(action_id = %decision.id, %reason, "rejecting malformed decision");
            Metrics::incr(&self.metrics.actions_rejected);
            self.bus.publish_payload(
                &decision.correlation_id,
                EventPayload::ActionRejected {
                    action_id: decision.id.clone(),
                    reason: reason.clone(),
                },
            );
            return Err(AdmitError::Validation(reason));
        }

        // A decision may claim less urgency than its type allows, never more.
        if let Some(&ceiling) = self.config.max_priority_by_type.get(&decision.action_type) {
            if decision.priority.outranks(ceiling) {
                debug!(
                    action_id = %decision.id,
                    claimed = decision.priority.as_str(),
                    ceiling = ceiling.as_str(),
                    "downgrading priority claim"
                );
                decision.priority = ceiling;
            }
        }

        if decision.idempotency_key.is_none() {
            decision.idempotency_key = Some(derive_idempotency_key(&decision));
        }

        let record = ActionRecord::new(decision);
        let correlation_id = record.decision.correlation_id.clone();
        let action_id = record.decision.id.clone();
        let priority = record.priority();

        let admitted_body = json!({"decision": record.decision});

        // Publish admission before the record becomes visible to workers so
        // `action:queued` always precedes that action's `action:started`.
        self.bus.publish_payload(
            &correlation_id,
            EventPayload::ActionQueued {
                action_id: action_id.clone(),
                priority,
            },
        );

        match self.queue.enqueue(record) {
            Ok(evicted) => {
                Metrics::incr(&self.metrics.actions_admitted);
                if let Some(journal) = &self.journal {
                    journal.append(JournalKind::ActionAdmitted, &action_id, admitted_body);
                }
                if let Some(victim) = evicted {
                    Metrics::incr(&self.metrics.evictions_total);
                    Metrics::incr(&self.metrics.actions_rejected);
                    self.bus.publish_payload(
                        &victim.decision.correlation_id,
                        EventPayload::ActionRejected {
                            action_id: victim.decision.id.clone(),
                            reason: "queue_full_evicted".to_string(),
                        },
                    );
                }
                Ok(())
            }
            Err(QueueFull) => {
                Metrics::incr(&self.metrics.actions_rejected);
                self.bus.publish_payload(
                    &correlation_id,
                    EventPayload::ActionRejected {
                        action_id,
                        reason: "queue_full".to_string(),
                    },
                );
                Err(AdmitError::QueueFull)
            }
        }
    }
}

/// Required parameter keys per action type; only the shape needed for
/// routing is checked, the adapter interprets the rest.
fn required_keys(action_type: ActionType) -> &'static [&'static str] {
    match action_type {
        ActionType::CreateTask => &["title"],
        ActionType::UpdateTask => &["task_id"],
        ActionType::Notify => &["message"],
        ActionType::FileDocument => &["name"],
        ActionType::AppendRow => &["values"],
        ActionType::Log => &[],
    }
}

fn validate_params(decision: &ActionDecision) -> Result<(), String> {
    if decision.id.trim().is_empty() {
        return Err("missing action id".to_string());
    }
    let required = required_keys(decision.action_type);
    if required.is_empty() {
        return Ok(());
    }
    let Some(obj) = decision.params.as_object() else {
        return Err(format!(
            "params for {} must be an object",
            decision.action_type
        ));
    };
    for key in required {
        if !obj.contains_key(*key) {
            return Err(format!(
                "params for {} missing required key '{key}'",
                decision.action_type
            ));
        }
    }
    Ok(())
}

/// `type + platform + hash(params)` for decisions that arrive without a key.
pub fn derive_idempotency_key(decision: &ActionDecision) -> String {
    let canonical = decision.params.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!(
        "{}:{}:{}",
        decision.action_type,
        decision.platform,
        hex::encode(&digest[..8])
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use conductor_types::Platform;

    fn decision(id: &str, action_type: ActionType, params: serde_json::Value) -> ActionDecision {
        ActionDecision {
            id: id.to_string(),
            correlation_id: format!("sig-{id}"),
            action_type,
            platform: Platform::Notion,
            priority: Priority::Normal,
            params,
            requires_approval: false,
            idempotency_key: None,
            fallback_chain: Vec::new(),
            timeout_ms: None,
            approved_by: None,
            compensates_external_id: None,
        }
    }

    fn router(queue_size: usize) -> (ActionRouter, Arc<PriorityQueue>, EventBus) {
        let queue = Arc::new(PriorityQueue::new(&QueueConfig {
            max_size: queue_size,
            starvation_guard_k: 16,
        }));
        let bus = EventBus::new();
        let router = ActionRouter::new(
            queue.clone(),
            bus.clone(),
            Arc::new(Metrics::new()),
            None,
            RouterConfig::default(),
        );
        (router, queue, bus)
    }

    #[tokio::test]
    async fn admits_valid_decision_and_emits_queued() {
        let (router, queue, bus) = router(8);
        let mut rx = bus.subscribe();
        router
            .submit(decision("a1", ActionType::CreateTask, json!({"title": "t"})))
            .unwrap();
        assert_eq!(queue.len(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.kind(), "action:queued");
    }

    #[tokio::test]
    async fn rejects_missing_required_key() {
        let (router, queue, bus) = router(8);
        let mut rx = bus.subscribe();
        let err = router
            .submit(decision("a1", ActionType::CreateTask, json!({})))
            .unwrap_err();
        assert!(matches!(err, AdmitError::Validation(_)));
        assert!(queue.is_empty());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.kind(), "action:rejected");
    }

    #[tokio::test]
    async fn log_actions_need_no_params() {
        let (router, queue, _) = router(8);
        router
            .submit(decision("a1", ActionType::Log, serde_json::Value::Null))
            .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn priority_claims_are_downgraded_not_upgraded() {
        let queue = Arc::new(PriorityQueue::new(&QueueConfig::default()));
        let bus = EventBus::new();
        let mut config = RouterConfig::default();
        config
            .max_priority_by_type
            .insert(ActionType::Log, Priority::Low);
        let router = ActionRouter::new(
            queue.clone(),
            bus,
            Arc::new(Metrics::new()),
            None,
            config,
        );

        let mut claimed = decision("a1", ActionType::Log, json!({}));
        claimed.priority = Priority::Critical;
        router.submit(claimed).unwrap();
        let record = queue.try_dequeue().unwrap();
        assert_eq!(record.priority(), Priority::Low);
    }

    #[tokio::test]
    async fn missing_idempotency_key_is_derived_and_stable() {
        let (router, queue, _) = router(8);
        router
            .submit(decision("a1", ActionType::CreateTask, json!({"title": "t"})))
            .unwrap();
        router
            .submit(decision("a2", ActionType::CreateTask, json!({"title": "t"})))
            .unwrap();
        let first = queue.try_dequeue().unwrap();
        let second = queue.try_dequeue().unwrap();
        let k1 = first.decision.idempotency_key.unwrap();
        let k2 = second.decision.idempotency_key.unwrap();
        assert_eq!(k1, k2);
        assert!(k1.starts_with("create_task:notion:"));
    }

    #[tokio::test]
    async fn eviction_emits_rejected_for_victim() {
        let (router, _queue, bus) = router(1);
        let mut rx = bus.subscribe();
        let mut low = decision("low", ActionType::Log, json!({}));
        low.priority = Priority::Low;
        router.submit(low).unwrap();

        let mut crit = decision("crit", ActionType::Log, json!({}));
        crit.priority = Priority::Critical;
        router.submit(crit).unwrap();

        let kinds: Vec<(String, &'static str)> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| (e.correlation_id.clone(), e.payload.kind()))
        .collect();
        assert!(kinds.contains(&("sig-low".to_string(), "action:queued")));
        assert!(kinds.contains(&("sig-crit".to_string(), "action:queued")));
        assert!(kinds.contains(&("sig-low".to_string(), "action:rejected")));
    }
}
