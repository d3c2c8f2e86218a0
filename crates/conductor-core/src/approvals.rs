use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

use conductor_types::{ActionDecision, EventPayload, WorkflowSpec};

use crate::config::{ApprovalConfig, TimeoutAction};
use crate::event_bus::EventBus;
use crate::journal::{Journal, JournalKind};
use crate::metrics::Metrics;

/// What a review gates: a single action or a whole workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalTarget {
    Action { decision: ActionDecision },
    Workflow { spec: WorkflowSpec },
}

impl ApprovalTarget {
    pub fn id(&self) -> &str {
        match self {
            ApprovalTarget::Action { decision } => &decision.id,
            ApprovalTarget::Workflow { spec } => &spec.workflow_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            ApprovalTarget::Action { decision } => &decision.correlation_id,
            ApprovalTarget::Workflow { spec } => &spec.correlation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

/// One held review awaiting a human (or timer) decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    pub review_id: String,
    pub target: ApprovalTarget,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub timeout_action: TimeoutAction,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Result of an approve/reject call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Ok,
    AlreadyDecided,
    UnknownReview,
}

/// Resubmission channels the embedding context drains: approved actions go
/// back through the router, approved workflows through the engine. The
/// channel indirection keeps the coordinator free of back-references.
pub struct ApprovalChannels {
    pub actions: mpsc::UnboundedReceiver<ActionDecision>,
    pub workflows: mpsc::UnboundedReceiver<WorkflowSpec>,
}

/// Holds pending reviews, arms their timeout timers, and resumes approved
/// work into the normal execution path. The reviews map's write lock is the
/// single serialization point: the first terminal decision wins, whether it
/// came from a human or the timer.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    reviews: Arc<RwLock<HashMap<String, PendingReview>>>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    journal: Option<Arc<Journal>>,
    defaults: ApprovalConfig,
    action_tx: mpsc::UnboundedSender<ActionDecision>,
    workflow_tx: mpsc::UnboundedSender<WorkflowSpec>,
}

impl ApprovalCoordinator {
    pub fn new(
        bus: EventBus,
        metrics: Arc<Metrics>,
        journal: Option<Arc<Journal>>,
        defaults: ApprovalConfig,
    ) -> (Self, ApprovalChannels) {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (workflow_tx, workflow_rx) = mpsc::unbounded_channel();
        (
            Self {
                reviews: Arc::new(RwLock::new(HashMap::new())),
                bus,
                metrics,
                journal,
                defaults,
                action_tx,
                workflow_tx,
            },
            ApprovalChannels {
                actions: action_rx,
                workflows: workflow_rx,
            },
        )
    }

    /// Park a target for review and arm its single-shot timeout timer.
    pub async fn request_approval(
        &self,
        target: ApprovalTarget,
        reason: impl Into<String>,
        timeout: Option<Duration>,
        timeout_action: Option<TimeoutAction>,
    ) -> String {
        let reason = reason.into();
        let timeout =
            timeout.unwrap_or(Duration::from_millis(self.defaults.default_timeout_ms));
        let timeout_action = timeout_action.unwrap_or(self.defaults.default_timeout_action);

        let review = PendingReview {
            review_id: Uuid::new_v4().to_string(),
            reason: reason.clone(),
            queued_at: Utc::now(),
            timeout_at: Utc::now()
                + chrono::Duration::milliseconds(timeout.as_millis() as i64),
            timeout_action,
            status: ReviewStatus::Pending,
            reviewer: None,
            notes: None,
            target,
        };
        let review_id = review.review_id.clone();

        Metrics::incr(&self.metrics.approvals_requested);
        self.bus.publish_payload(
            review.target.correlation_id(),
            EventPayload::ActionRequiresApproval {
                action_id: review.target.id().to_string(),
                review_id: review_id.clone(),
                reason,
                timeout_at: review.timeout_at,
            },
        );
        self.journal_transition(&review);
        self.reviews
            .write()
            .await
            .insert(review_id.clone(), review);

        // Single-shot timer; losing the race to a human decision is handled
        // by the first-terminal-write-wins rule in decide().
        let coordinator = self.clone();
        let timer_review_id = review_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.fire_timeout(&timer_review_id).await;
        });

        review_id
    }

    pub async fn approve(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> ReviewOutcome {
        self.decide(review_id, true, reviewer, notes, false).await
    }

    pub async fn reject(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> ReviewOutcome {
        self.decide(review_id, false, reviewer, notes, false).await
    }

    pub async fn get(&self, review_id: &str) -> Option<PendingReview> {
        self.reviews.read().await.get(review_id).cloned()
    }

    pub async fn pending(&self) -> Vec<PendingReview> {
        self.reviews
            .read()
            .await
            .values()
            .filter(|r| r.status == ReviewStatus::Pending)
            .cloned()
            .collect()
    }

    async fn fire_timeout(&self, review_id: &str) {
        let action = match self.reviews.read().await.get(review_id) {
            Some(review) if review.status == ReviewStatus::Pending => review.timeout_action,
            _ => return,
        };
        let approve = action == TimeoutAction::Approve;
        let notes = if approve {
            Some("auto-approved on timeout".to_string())
        } else {
            Some("auto-rejected on timeout".to_string())
        };
        if self.decide(review_id, approve, "system", notes, true).await == ReviewOutcome::Ok {
            Metrics::incr(&self.metrics.approvals_timed_out);
        }
    }

    async fn decide(
        &self,
        review_id: &str,
        approve: bool,
        reviewer: &str,
        notes: Option<String>,
        timed_out: bool,
    ) -> ReviewOutcome {
        let review = {
            let mut reviews = self.reviews.write().await;
            let Some(review) = reviews.get_mut(review_id) else {
                return ReviewOutcome::UnknownReview;
            };
            if review.status != ReviewStatus::Pending {
                return ReviewOutcome::AlreadyDecided;
            }
            review.status = if timed_out {
                ReviewStatus::TimedOut
            } else if approve {
                ReviewStatus::Approved
            } else {
                ReviewStatus::Rejected
            };
            review.reviewer = Some(reviewer.to_string());
            review.notes = notes;
            review.clone()
        };

        self.journal_transition(&review);
        info!(
            review_id = %review.review_id,
            target = %review.target.id(),
            approved = approve,
            timed_out,
            "review decided"
        );

        if approve {
            self.resume(&review);
        } else {
            let reason = if timed_out {
                "approval_timeout".to_string()
            } else {
                "approval_rejected".to_string()
            };
            self.bus.publish_payload(
                review.target.correlation_id(),
                EventPayload::ActionRejected {
                    action_id: review.target.id().to_string(),
                    reason,
                },
            );
            Metrics::incr(&self.metrics.actions_rejected);
        }
        ReviewOutcome::Ok
    }

    /// Re-enter the execution path with approval cleared and the original
    /// idempotency key intact, so a duplicate arrival after a restart
    /// cannot double-execute.
    fn resume(&self, review: &PendingReview) {
        match &review.target {
            ApprovalTarget::Action { decision } => {
                let mut resubmit = decision.clone();
                resubmit.requires_approval = false;
                resubmit.approved_by = review.reviewer.clone();
                let _ = self.action_tx.send(resubmit);
            }
            ApprovalTarget::Workflow { spec } => {
                let _ = self.workflow_tx.send(spec.clone());
            }
        }
    }

    fn journal_transition(&self, review: &PendingReview) {
        if let Some(journal) = &self.journal {
            journal.append(
                JournalKind::ReviewTransition,
                &review.review_id,
                json!({"review": review}),
            );
        }
    }
}
