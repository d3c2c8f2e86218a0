use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conductor_observability::redact_fields;
use conductor_platforms::PlatformRegistry;
use conductor_types::{ActionState, ActionStatus, ErrorKind, EventPayload};

use crate::approvals::{ApprovalCoordinator, ApprovalTarget};
use crate::event_bus::EventBus;
use crate::journal::{Journal, JournalKind};
use crate::metrics::Metrics;
use crate::pipeline::ExecutorPipeline;
use crate::queue::PriorityQueue;
use crate::router::ActionRecord;

/// Everything one worker needs; cheap to clone per task.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<PriorityQueue>,
    pub pipeline: ExecutorPipeline,
    pub approvals: ApprovalCoordinator,
    pub registry: PlatformRegistry,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub journal: Option<Arc<Journal>>,
}

/// Start `count` cooperative workers draining the shared queue. Each worker
/// owns at most one record at a time; the returned set joins on shutdown.
pub fn spawn_worker_pool(
    count: usize,
    ctx: WorkerContext,
    cancel: CancellationToken,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for worker_id in 0..count.max(1) {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            worker_loop(worker_id, ctx, cancel).await;
        });
    }
    set
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext, cancel: CancellationToken) {
    debug!(worker_id, "worker started");
    loop {
        let Some(record) = ctx.queue.dequeue(&cancel).await else {
            break;
        };
        run_one(&ctx, record).await;
    }
    debug!(worker_id, "worker stopped");
}

/// Dequeue → approval detour or pipeline → terminal event → drop record.
async fn run_one(ctx: &WorkerContext, mut record: ActionRecord) {
    if record.decision.requires_approval {
        record.state = ActionState::PendingApproval;
        let reason = format!(
            "{} on {} requires approval",
            record.decision.action_type, record.decision.platform
        );
        let timeout = record.decision.timeout_ms.map(Duration::from_millis);
        ctx.approvals
            .request_approval(
                ApprovalTarget::Action {
                    decision: record.decision.clone(),
                },
                reason,
                timeout,
                None,
            )
            .await;
        // The coordinator owns the rest of this action's life; the record
        // is rebuilt if it is approved and resubmitted.
        return;
    }

    record.state = ActionState::Running;
    record.first_started_at = Some(Utc::now());

    let outcome = ctx.pipeline.execute_full(&record.decision).await;
    record.attempts = outcome.attempts;
    record.completed_at = Some(Utc::now());
    let result = outcome.result;

    let masks = ctx
        .registry
        .redaction_masks(result.platform.unwrap_or(record.decision.platform))
        .await;

    match result.status {
        ActionStatus::Ok => {
            record.state = ActionState::Succeeded;
            Metrics::incr(&ctx.metrics.actions_completed);
            // A same-id resubmission served from the idempotency guard
            // already had its terminal event published by the original
            // execution.
            let same_action_dup = result.deduplicated
                && result.origin_action_id.as_deref() == Some(record.decision.id.as_str());
            if !same_action_dup {
                let mut value = result.value.clone();
                if let Some(value) = value.as_mut() {
                    redact_fields(value, &masks);
                }
                ctx.bus.publish_payload(
                    &record.decision.correlation_id,
                    EventPayload::ActionCompleted {
                        action_id: record.decision.id.clone(),
                        result: value,
                        external_id: result.external_id.clone(),
                        used_fallback: result.used_fallback,
                        fallback_platform: result.fallback_platform,
                    },
                );
            }
        }
        ActionStatus::Failed => {
            record.state = ActionState::Failed;
            record.last_error = result.message.clone();
            Metrics::incr(&ctx.metrics.actions_failed);
            ctx.bus.publish_payload(
                &record.decision.correlation_id,
                EventPayload::ActionFailed {
                    action_id: record.decision.id.clone(),
                    error_kind: result.error_kind.unwrap_or(ErrorKind::Transient),
                    message: result.message.clone().unwrap_or_default(),
                    platform: result.platform,
                    fallback_attempted: result.used_fallback,
                },
            );
        }
        ActionStatus::Rejected | ActionStatus::PendingApproval => {
            record.state = ActionState::Rejected;
            Metrics::incr(&ctx.metrics.actions_rejected);
            ctx.bus.publish_payload(
                &record.decision.correlation_id,
                EventPayload::ActionRejected {
                    action_id: record.decision.id.clone(),
                    reason: result.message.clone().unwrap_or_default(),
                },
            );
        }
    }

    if let Some(journal) = &ctx.journal {
        let mut body = json!({"result": result, "state": record.state});
        redact_fields(&mut body, &masks);
        journal.append(JournalKind::ActionTerminal, &record.decision.id, body);
    }

    info!(
        action_id = %record.decision.id,
        state = ?record.state,
        attempts = result.attempts,
        "action finished"
    );
    // Record dropped here: terminal state has been published.
}
