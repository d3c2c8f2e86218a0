use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor_platforms::PlatformRegistry;
use conductor_types::{
    ActionDecision, EventPayload, OrchestratorEvent, WorkflowSpec,
};
use conductor_workflow::{
    EventSink, SubmitFn, WorkflowEngine, WorkflowRun, WorkflowValidationError,
};

use crate::approvals::{ApprovalChannels, ApprovalCoordinator, ApprovalTarget, ReviewOutcome};
use crate::breaker::BreakerRegistry;
use crate::config::{OrchestratorConfig, TimeoutAction};
use crate::event_bus::{recv_counting_lag, EventBus};
use crate::idempotency::IdempotencyGuard;
use crate::journal::{build_recovery_plan, Journal, JournalKind, RecoveryReport};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::pipeline::ExecutorPipeline;
use crate::queue::PriorityQueue;
use crate::rate_limit::RateLimiter;
use crate::router::{ActionRouter, AdmitError};
use crate::workers::{spawn_worker_pool, WorkerContext};

/// Owns every piece of shared state and the background tasks that connect
/// them. Constructed once at startup; there are no ambient globals.
pub struct OrchestratorContext {
    config: OrchestratorConfig,
    bus: EventBus,
    registry: PlatformRegistry,
    queue: Arc<PriorityQueue>,
    router: Arc<ActionRouter>,
    pipeline: ExecutorPipeline,
    approvals: ApprovalCoordinator,
    engine: WorkflowEngine,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
    journal: Option<Arc<Journal>>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    recovery: RecoveryReport,
}

impl OrchestratorContext {
    /// Build the execution plane, replay the journal if enabled, and start
    /// the worker pool plus the plumbing tasks.
    pub async fn start(
        config: OrchestratorConfig,
        registry: PlatformRegistry,
    ) -> anyhow::Result<Arc<Self>> {
        let bus = EventBus::new();
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let journal = if config.journal.enabled {
            Some(Arc::new(Journal::open(
                &config.journal.path,
                Duration::from_millis(config.journal.flush_every_ms),
            )))
        } else {
            None
        };

        let recovery_plan = if config.journal.enabled {
            let records = Journal::read_all(&config.journal.path).await?;
            Some(build_recovery_plan(
                &records,
                Duration::from_millis(config.idempotency.ttl_ms),
                Utc::now(),
            ))
        } else {
            None
        };

        let idempotency =
            IdempotencyGuard::new(Duration::from_millis(config.idempotency.ttl_ms));
        if let Some(plan) = &recovery_plan {
            for (key, result, age) in &plan.idempotency {
                idempotency.restore_done(key, result.clone(), *age).await;
            }
        }

        let limiter = Arc::new(RateLimiter::new(&config.rate_limiter));
        let breakers = Arc::new(BreakerRegistry::new(&config.breaker, bus.clone()));
        let pipeline = ExecutorPipeline::new(
            registry.clone(),
            limiter.clone(),
            breakers.clone(),
            config.retry.clone(),
            idempotency.clone(),
            bus.clone(),
            metrics.clone(),
            journal.clone(),
            Duration::from_millis(config.deadlines.default_action_ms),
        );

        let queue = Arc::new(PriorityQueue::new(&config.queue));
        let router = Arc::new(ActionRouter::new(
            queue.clone(),
            bus.clone(),
            metrics.clone(),
            journal.clone(),
            config.router.clone(),
        ));

        let (approvals, approval_channels) = ApprovalCoordinator::new(
            bus.clone(),
            metrics.clone(),
            journal.clone(),
            config.approval.clone(),
        );

        let engine = WorkflowEngine::new(
            workflow_submit_fn(pipeline.clone(), journal.clone()),
            workflow_event_sink(bus.clone()),
            config.workflow.concurrency_per_run,
        );

        let recovery = recovery_plan
            .as_ref()
            .map(|plan| plan.report())
            .unwrap_or_default();
        if let Some(plan) = &recovery_plan {
            plan.log();
        }

        let ctx = Arc::new(Self {
            config: config.clone(),
            bus: bus.clone(),
            registry: registry.clone(),
            queue: queue.clone(),
            router: router.clone(),
            pipeline: pipeline.clone(),
            approvals: approvals.clone(),
            engine,
            limiter,
            breakers,
            metrics: metrics.clone(),
            journal: journal.clone(),
            cancel: cancel.clone(),
            tasks: Mutex::new(JoinSet::new()),
            recovery,
        });

        let mut tasks = spawn_worker_pool(
            config.workers.count,
            WorkerContext {
                queue,
                pipeline,
                approvals,
                registry,
                bus: bus.clone(),
                metrics,
                journal,
            },
            cancel.clone(),
        );

        spawn_plumbing(&ctx, &mut tasks, approval_channels);
        *ctx.tasks.lock().await = tasks;

        // Resume journaled workflows that never reached a terminal status.
        if let Some(plan) = recovery_plan {
            for resume in plan.workflows {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let workflow_id = resume.spec.workflow_id.clone();
                    ctx.journal_workflow_submitted(&resume.spec);
                    match ctx.engine.resume(resume.spec, resume.completed).await {
                        Ok(run) => ctx.journal_workflow_finished(&run),
                        Err(err) => {
                            warn!(workflow_id = %workflow_id, error = %err, "resume rejected")
                        }
                    }
                });
            }
        }

        info!(
            workers = ctx.config.workers.count,
            journal = ctx.config.journal.enabled,
            "orchestrator started"
        );
        Ok(ctx)
    }

    /// Validate and enqueue a single action.
    pub fn submit_action(&self, decision: ActionDecision) -> Result<(), AdmitError> {
        self.router.submit(decision)
    }

    /// Run a workflow to its terminal status.
    pub async fn submit_workflow(
        &self,
        spec: WorkflowSpec,
    ) -> Result<WorkflowRun, WorkflowValidationError> {
        self.journal_workflow_submitted(&spec);
        let run = self.engine.run(spec).await?;
        self.journal_workflow_finished(&run);
        Ok(run)
    }

    /// Park a workflow behind a human review instead of running it now.
    pub async fn request_workflow_approval(
        &self,
        spec: WorkflowSpec,
        reason: impl Into<String>,
        timeout: Option<Duration>,
        timeout_action: Option<TimeoutAction>,
    ) -> String {
        self.approvals
            .request_approval(
                ApprovalTarget::Workflow { spec },
                reason,
                timeout,
                timeout_action,
            )
            .await
    }

    pub async fn approve(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> ReviewOutcome {
        self.approvals.approve(review_id, reviewer, notes).await
    }

    pub async fn reject(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> ReviewOutcome {
        self.approvals.reject(review_id, reviewer, notes).await
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> bool {
        self.engine.cancel(workflow_id).await
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            generated_at: Utc::now(),
            queue_depth: self.queue.len(),
            inflight_actions: self.pipeline.idempotency().len().await,
            breakers: self.breakers.snapshots(),
            bucket_levels: self.limiter.levels(),
            counters: self.metrics.counters_map(),
            latency: self.metrics.latency_snapshot(),
            bus_lagged: self.bus.lagged_total(),
        }
    }

    /// Stop accepting work, drain in-flight actions, flush the journal, and
    /// log a final health snapshot.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        if let Some(journal) = &self.journal {
            journal.shutdown().await;
        }
        let health = self.health().await;
        match serde_json::to_string(&health) {
            Ok(snapshot) => info!(snapshot = %snapshot, "orchestrator stopped"),
            Err(_) => info!("orchestrator stopped"),
        }
    }

    fn journal_workflow_submitted(&self, spec: &WorkflowSpec) {
        if let Some(journal) = &self.journal {
            journal.append(
                JournalKind::WorkflowStep,
                &spec.workflow_id,
                json!({"phase": "submitted", "spec": spec}),
            );
        }
    }

    fn journal_workflow_finished(&self, run: &WorkflowRun) {
        if run.status == conductor_types::WorkflowStatus::Completed {
            Metrics::incr(&self.metrics.workflows_completed);
        } else if matches!(
            run.status,
            conductor_types::WorkflowStatus::RolledBack
                | conductor_types::WorkflowStatus::PartiallyRolledBack
        ) {
            Metrics::incr(&self.metrics.workflows_rolled_back);
        }
        if let Some(journal) = &self.journal {
            journal.append(
                JournalKind::WorkflowStep,
                &run.workflow_id,
                json!({"phase": "finished", "status": run.status}),
            );
        }
    }
}

/// The engine's submit callback: every step and compensator goes through
/// the executor pipeline; successful steps are journaled with their full
/// result so rollback state survives a restart.
fn workflow_submit_fn(pipeline: ExecutorPipeline, journal: Option<Arc<Journal>>) -> SubmitFn {
    Arc::new(move |decision: ActionDecision| {
        let pipeline = pipeline.clone();
        let journal = journal.clone();
        Box::pin(async move {
            let result = pipeline.execute(&decision).await;
            if result.is_ok() && decision.compensates_external_id.is_none() {
                if let (Some(journal), Some((workflow_id, step))) =
                    (journal.as_ref(), decision.id.split_once(':'))
                {
                    journal.append(
                        JournalKind::WorkflowStep,
                        workflow_id,
                        json!({"phase": "step_completed", "step": step, "result": result}),
                    );
                }
            }
            result
        })
    })
}

fn workflow_event_sink(bus: EventBus) -> EventSink {
    Arc::new(move |event| bus.publish(event))
}

/// Background plumbing: approval resubmissions, inbound bus subscriptions,
/// and idempotency housekeeping.
fn spawn_plumbing(
    ctx: &Arc<OrchestratorContext>,
    tasks: &mut JoinSet<()>,
    mut approval_channels: ApprovalChannels,
) {
    // Approved actions re-enter through the router.
    {
        let ctx = ctx.clone();
        let cancel = ctx.cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    decision = approval_channels.actions.recv() => {
                        let Some(decision) = decision else { break };
                        if let Err(err) = ctx.router.submit(decision) {
                            warn!(error = %err, "approved action could not be readmitted");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Approved workflows run on their own task.
    {
        let ctx = ctx.clone();
        let cancel = ctx.cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    spec = approval_channels.workflows.recv() => {
                        let Some(spec) = spec else { break };
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let workflow_id = spec.workflow_id.clone();
                            if let Err(err) = ctx.submit_workflow(spec).await {
                                warn!(workflow_id = %workflow_id, error = %err, "approved workflow rejected");
                            }
                        });
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Inbound events from the decision producer.
    {
        let ctx = ctx.clone();
        let cancel = ctx.cancel.clone();
        let bus = ctx.bus.clone();
        let mut rx = bus.subscribe();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    event = recv_counting_lag(&bus, &mut rx) => {
                        let Some(event) = event else { break };
                        match event.payload {
                            EventPayload::ActionReady { decision } => {
                                let _ = ctx.router.submit(decision);
                            }
                            EventPayload::WorkflowSubmit { spec } => {
                                let ctx = ctx.clone();
                                tokio::spawn(async move {
                                    let workflow_id = spec.workflow_id.clone();
                                    if let Err(err) = ctx.submit_workflow(spec).await {
                                        warn!(workflow_id = %workflow_id, error = %err, "inbound workflow rejected");
                                    }
                                });
                            }
                            _ => {}
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Idempotency housekeeping.
    {
        let ctx = ctx.clone();
        let cancel = ctx.cancel.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => ctx.pipeline.idempotency().purge_expired().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
