use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor_types::{
    ActionDecision, ActionResult, EventPayload, OrchestratorEvent, Priority, StepSpec,
    WorkflowSpec, WorkflowStatus,
};

use crate::model::{CompensationOutcome, Compensator, WorkflowRun};
use crate::scheduler::{StepScheduler, WorkflowValidationError};

/// Callback the engine drives every step and compensator through. Wired to
/// the executor pipeline by the embedding context; keeping it a parameter
/// avoids a reference cycle between engine and executor.
pub type SubmitFn = Arc<dyn Fn(ActionDecision) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Outbound event hook, wired to the bus by the embedding context.
pub type EventSink = Arc<dyn Fn(OrchestratorEvent) + Send + Sync>;

enum CacheEntry {
    Inflight(watch::Sender<Option<WorkflowRun>>),
    Done(WorkflowRun),
}

/// Runs workflows: dependency order, bounded step concurrency, step-level
/// idempotency keys, and LIFO compensating rollback on failure.
#[derive(Clone)]
pub struct WorkflowEngine {
    submit: SubmitFn,
    events: EventSink,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    cancel_tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
    concurrency_per_run: usize,
}

impl WorkflowEngine {
    pub fn new(submit: SubmitFn, events: EventSink, concurrency_per_run: usize) -> Self {
        Self {
            submit,
            events,
            cache: Arc::new(RwLock::new(HashMap::new())),
            cancel_tokens: Arc::new(RwLock::new(HashMap::new())),
            concurrency_per_run: concurrency_per_run.max(1),
        }
    }

    /// Execute a workflow, or return the cached/joined run for a repeated
    /// idempotency key. Structural problems reject before any side effect.
    pub async fn run(&self, spec: WorkflowSpec) -> Result<WorkflowRun, WorkflowValidationError> {
        self.run_with_seed(spec, Vec::new()).await
    }

    /// Resume a workflow recovered from the journal: `prior` carries the
    /// results of steps that completed before the restart. Remaining
    /// non-idempotent steps fail the run and trigger the rollback policy.
    pub async fn resume(
        &self,
        spec: WorkflowSpec,
        prior: Vec<(String, ActionResult)>,
    ) -> Result<WorkflowRun, WorkflowValidationError> {
        self.run_with_seed(spec, prior).await
    }

    /// Request cancellation: the in-flight steps finish, remaining steps are
    /// skipped, and the rollback policy applies. Returns false for unknown
    /// or already-finished workflows.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        match self.cancel_tokens.read().await.get(workflow_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_with_seed(
        &self,
        spec: WorkflowSpec,
        prior: Vec<(String, ActionResult)>,
    ) -> Result<WorkflowRun, WorkflowValidationError> {
        StepScheduler::validate(&spec.steps)?;

        // Completed-workflow cache: a repeat submission joins the in-flight
        // run or returns the finished one, never re-executing steps.
        let mut waiter = {
            let mut cache = self.cache.write().await;
            match cache.get(&spec.idempotency_key) {
                Some(CacheEntry::Done(run)) => return Ok(run.clone()),
                Some(CacheEntry::Inflight(tx)) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = watch::channel(None);
                    cache.insert(spec.idempotency_key.clone(), CacheEntry::Inflight(tx));
                    None
                }
            }
        };

        if let Some(rx) = waiter.as_mut() {
            loop {
                if let Some(run) = rx.borrow().clone() {
                    return Ok(run);
                }
                if rx.changed().await.is_err() {
                    // First runner dropped without finishing; fall through
                    // and execute ourselves.
                    break;
                }
            }
        }

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .write()
            .await
            .insert(spec.workflow_id.clone(), cancel.clone());

        let run = self.execute(&spec, prior, cancel).await;

        self.cancel_tokens.write().await.remove(&spec.workflow_id);
        {
            let mut cache = self.cache.write().await;
            if let Some(CacheEntry::Inflight(tx)) =
                cache.insert(spec.idempotency_key.clone(), CacheEntry::Done(run.clone()))
            {
                let _ = tx.send(Some(run.clone()));
            }
        }
        Ok(run)
    }

    async fn execute(
        &self,
        spec: &WorkflowSpec,
        prior: Vec<(String, ActionResult)>,
        cancel: CancellationToken,
    ) -> WorkflowRun {
        let correlation_id = if spec.correlation_id.is_empty() {
            spec.workflow_id.clone()
        } else {
            spec.correlation_id.clone()
        };
        let steps_by_name: HashMap<&str, &StepSpec> =
            spec.steps.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut run = WorkflowRun::new(&spec.workflow_id, &correlation_id);
        run.status = WorkflowStatus::Running;

        // Seed state recovered from the journal.
        for (name, result) in prior {
            if let Some(step) = steps_by_name.get(name.as_str()) {
                if let Some(comp) = &step.on_compensate {
                    run.rollback_stack.push(Compensator {
                        step: name.clone(),
                        platform: step.platform,
                        action_type: comp.action_type,
                        external_id: result.external_id.clone(),
                        params: comp.params.clone(),
                    });
                }
                run.record_success(&name, result);
            }
        }

        let completed_seed: HashSet<String> = run.completed_steps.iter().cloned().collect();
        let non_idempotent_remaining = spec
            .steps
            .iter()
            .find(|s| !s.idempotent && !completed_seed.contains(&s.name));

        let failure = if let Some(blocked) = non_idempotent_remaining {
            // Resuming past this step could double-execute it.
            warn!(
                workflow_id = %spec.workflow_id,
                step = %blocked.name,
                "non-idempotent step cannot be resumed; failing workflow"
            );
            Some(blocked.name.clone())
        } else {
            self.drive_steps(spec, &mut run, &correlation_id, &cancel)
                .await
        };

        run.cancelled = cancel.is_cancelled();

        let all_completed = run.completed_steps.len() == spec.steps.len();
        if failure.is_none() && all_completed {
            // A cancel that lands after the last step completes is a no-op.
            run.finish(WorkflowStatus::Completed);
        } else {
            run.failed_step = failure.clone();
            if spec.transactional && !run.rollback_stack.is_empty() {
                let status = self.rollback(spec, &mut run, &correlation_id).await;
                run.finish(status);
            } else {
                run.finish(WorkflowStatus::Failed);
            }
        }

        self.emit(
            &correlation_id,
            EventPayload::WorkflowFinished {
                workflow_id: spec.workflow_id.clone(),
                status: run.status,
            },
        );
        info!(
            workflow_id = %spec.workflow_id,
            status = run.status.as_str(),
            completed = run.completed_steps.len(),
            "workflow finished"
        );
        run
    }

    /// Launch ready steps up to the per-run concurrency bound and fold in
    /// completions until the workflow finishes, fails, or is cancelled.
    /// Returns the name of the first failed step, if any.
    async fn drive_steps(
        &self,
        spec: &WorkflowSpec,
        run: &mut WorkflowRun,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let steps_by_name: HashMap<&str, &StepSpec> =
            spec.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let skipped = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, ActionResult)> = JoinSet::new();
        let mut failure: Option<String> = None;

        loop {
            if failure.is_none() && !cancel.is_cancelled() {
                let completed: HashSet<String> = run.completed_steps.iter().cloned().collect();
                for step in StepScheduler::ready(&spec.steps, &completed, &in_flight, &skipped) {
                    if in_flight.len() >= self.concurrency_per_run {
                        break;
                    }
                    in_flight.insert(step.name.clone());
                    let decision = step_decision(spec, step);
                    let submit = self.submit.clone();
                    let name = step.name.clone();
                    join_set.spawn(async move { (name, submit(decision).await) });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((name, result)) => {
                    in_flight.remove(&name);
                    if result.is_ok() {
                        if let Some(step) = steps_by_name.get(name.as_str()) {
                            if let Some(comp) = &step.on_compensate {
                                run.rollback_stack.push(Compensator {
                                    step: name.clone(),
                                    platform: step.platform,
                                    action_type: comp.action_type,
                                    external_id: result.external_id.clone(),
                                    params: comp.params.clone(),
                                });
                            }
                        }
                        self.emit(
                            correlation_id,
                            EventPayload::WorkflowStepCompleted {
                                workflow_id: spec.workflow_id.clone(),
                                step: name.clone(),
                                result: result.value.clone(),
                            },
                        );
                        run.record_success(&name, result);
                    } else {
                        run.step_results.insert(name.clone(), result);
                        if failure.is_none() {
                            failure = Some(name);
                        }
                    }
                }
                Err(join_err) => {
                    warn!(workflow_id = %spec.workflow_id, error = %join_err, "step task failed to join");
                    if failure.is_none() {
                        failure = Some("<internal>".to_string());
                    }
                    // In-flight bookkeeping for the lost task is unknowable;
                    // stop launching and drain what remains.
                    in_flight.clear();
                }
            }
        }

        failure
    }

    /// Pop the rollback stack LIFO, driving each compensator through the
    /// executor pipeline so it gets its own retry and breaker protection.
    async fn rollback(
        &self,
        spec: &WorkflowSpec,
        run: &mut WorkflowRun,
        correlation_id: &str,
    ) -> WorkflowStatus {
        self.emit(
            correlation_id,
            EventPayload::WorkflowRollbackStarted {
                workflow_id: spec.workflow_id.clone(),
                failed_step: run.failed_step.clone().unwrap_or_default(),
            },
        );

        let mut any_failed = false;
        while let Some(comp) = run.rollback_stack.pop() {
            let decision = compensation_decision(spec, &comp);
            let result = (self.submit)(decision).await;
            if !result.is_ok() {
                any_failed = true;
                self.emit(
                    correlation_id,
                    EventPayload::WorkflowRollbackFailed {
                        workflow_id: spec.workflow_id.clone(),
                        step: comp.step.clone(),
                    },
                );
            }
            run.compensation_results.push(CompensationOutcome {
                step: comp.step.clone(),
                result,
            });
        }

        if any_failed {
            WorkflowStatus::PartiallyRolledBack
        } else {
            self.emit(
                correlation_id,
                EventPayload::WorkflowRolledBack {
                    workflow_id: spec.workflow_id.clone(),
                },
            );
            WorkflowStatus::RolledBack
        }
    }

    fn emit(&self, correlation_id: &str, payload: EventPayload) {
        (self.events)(OrchestratorEvent::new(correlation_id, payload));
    }
}

/// Build the action submitted for one step. The idempotency key is derived
/// from the workflow key so a re-driven run cannot double-execute a step.
fn step_decision(spec: &WorkflowSpec, step: &StepSpec) -> ActionDecision {
    ActionDecision {
        id: format!("{}:{}", spec.workflow_id, step.name),
        correlation_id: if spec.correlation_id.is_empty() {
            spec.workflow_id.clone()
        } else {
            spec.correlation_id.clone()
        },
        action_type: step.action_type,
        platform: step.platform,
        priority: step.priority,
        params: step.params.clone(),
        requires_approval: false,
        idempotency_key: Some(format!("{}:{}", spec.idempotency_key, step.name)),
        fallback_chain: step.fallback_chain.clone(),
        timeout_ms: None,
        approved_by: None,
        compensates_external_id: None,
    }
}

fn compensation_decision(spec: &WorkflowSpec, comp: &Compensator) -> ActionDecision {
    let mut params = comp.params.clone();
    if !params.is_object() {
        params = json!({});
    }
    ActionDecision {
        id: format!("{}:compensate:{}", spec.workflow_id, comp.step),
        correlation_id: if spec.correlation_id.is_empty() {
            spec.workflow_id.clone()
        } else {
            spec.correlation_id.clone()
        },
        action_type: comp.action_type,
        platform: comp.platform,
        priority: Priority::High,
        params,
        requires_approval: false,
        idempotency_key: Some(format!("{}:compensate:{}", spec.idempotency_key, comp.step)),
        fallback_chain: Vec::new(),
        timeout_ms: None,
        approved_by: None,
        compensates_external_id: Some(comp.external_id.clone().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{ActionType, CompensationSpec, ErrorKind, Platform};
    use serde_json::json;
    use std::sync::Mutex;

    fn step(name: &str, platform: Platform, deps: Vec<&str>) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            action_type: ActionType::Log,
            platform,
            params: json!({}),
            depends_on: deps.into_iter().map(String::from).collect(),
            on_compensate: Some(CompensationSpec {
                action_type: ActionType::Log,
                params: json!({"undo": true}),
            }),
            idempotent: true,
            priority: Priority::Normal,
            fallback_chain: Vec::new(),
        }
    }

    fn spec(transactional: bool, steps: Vec<StepSpec>) -> WorkflowSpec {
        WorkflowSpec {
            workflow_id: "wf-1".to_string(),
            correlation_id: "sig-1".to_string(),
            idempotency_key: "wf-ik-1".to_string(),
            transactional,
            steps,
        }
    }

    /// Submit stub: records submitted decisions, fails the action ids listed
    /// in `fail`, succeeds everything else.
    fn recording_submit(
        log: Arc<Mutex<Vec<ActionDecision>>>,
        fail: Vec<&str>,
    ) -> SubmitFn {
        let fail: Vec<String> = fail.into_iter().map(String::from).collect();
        Arc::new(move |decision: ActionDecision| {
            let log = log.clone();
            let fail = fail.clone();
            Box::pin(async move {
                log.lock().unwrap().push(decision.clone());
                if fail.contains(&decision.id) {
                    ActionResult::failed(
                        decision.id.clone(),
                        decision.platform,
                        ErrorKind::Auth,
                        "denied",
                    )
                } else {
                    let mut ok = ActionResult::ok(decision.id.clone(), decision.platform);
                    ok.external_id = Some(format!("ext-{}", decision.id));
                    ok
                }
            })
        })
    }

    fn sink(events: Arc<Mutex<Vec<OrchestratorEvent>>>) -> EventSink {
        Arc::new(move |event| events.lock().unwrap().push(event))
    }

    #[tokio::test]
    async fn happy_path_runs_steps_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(recording_submit(log.clone(), vec![]), sink(events), 4);

        let run = engine
            .run(spec(
                false,
                vec![
                    step("A", Platform::Drive, vec![]),
                    step("B", Platform::Sheets, vec!["A"]),
                    step("C", Platform::Slack, vec!["B"]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.completed_steps, vec!["A", "B", "C"]);
        let submitted: Vec<String> =
            log.lock().unwrap().iter().map(|d| d.id.clone()).collect();
        assert_eq!(submitted, vec!["wf-1:A", "wf-1:B", "wf-1:C"]);
    }

    #[tokio::test]
    async fn transactional_failure_rolls_back_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(
            recording_submit(log.clone(), vec!["wf-1:C"]),
            sink(events.clone()),
            4,
        );

        let run = engine
            .run(spec(
                true,
                vec![
                    step("A", Platform::Drive, vec![]),
                    step("B", Platform::Sheets, vec!["A"]),
                    step("C", Platform::Slack, vec!["B"]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::RolledBack);
        assert_eq!(run.failed_step.as_deref(), Some("C"));
        // Compensators run newest-first: B then A.
        let comp_order: Vec<String> = run
            .compensation_results
            .iter()
            .map(|c| c.step.clone())
            .collect();
        assert_eq!(comp_order, vec!["B", "A"]);
        assert!(run.rollback_stack.is_empty());

        let kinds: Vec<&'static str> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload.kind())
            .collect();
        assert!(kinds.contains(&"workflow:rollback_started"));
        assert!(kinds.contains(&"workflow:rolled_back"));
    }

    #[tokio::test]
    async fn non_transactional_failure_leaves_work_in_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(
            recording_submit(log.clone(), vec!["wf-1:B"]),
            sink(events),
            4,
        );

        let run = engine
            .run(spec(
                false,
                vec![
                    step("A", Platform::Drive, vec![]),
                    step("B", Platform::Sheets, vec!["A"]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert!(run.compensation_results.is_empty());
        // No compensator was submitted.
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.compensates_external_id.is_none()));
    }

    #[tokio::test]
    async fn repeat_idempotency_key_returns_cached_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(recording_submit(log.clone(), vec![]), sink(events), 4);

        let workflow = spec(false, vec![step("A", Platform::Drive, vec![])]);
        let first = engine.run(workflow.clone()).await.unwrap();
        let second = engine.run(workflow).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.completed_steps, second.completed_steps);
        // Only the first submission executed the step.
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_failure_rejects_before_side_effects() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(recording_submit(log.clone(), vec![]), sink(events), 4);

        let mut bad = spec(false, vec![step("A", Platform::Drive, vec!["A"])]);
        bad.steps[0].depends_on = vec!["A".to_string()];
        let err = engine.run(bad).await.unwrap_err();
        assert!(matches!(err, WorkflowValidationError::CycleDetected { .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    /// Submit stub that sleeps before succeeding, for cancellation and
    /// concurrency tests.
    fn slow_submit(
        log: Arc<Mutex<Vec<ActionDecision>>>,
        inflight_peak: Arc<Mutex<(usize, usize)>>,
        delay: std::time::Duration,
    ) -> SubmitFn {
        Arc::new(move |decision: ActionDecision| {
            let log = log.clone();
            let peak = inflight_peak.clone();
            Box::pin(async move {
                {
                    let mut peak = peak.lock().unwrap();
                    peak.0 += 1;
                    peak.1 = peak.1.max(peak.0);
                }
                tokio::time::sleep(delay).await;
                {
                    peak.lock().unwrap().0 -= 1;
                }
                log.lock().unwrap().push(decision.clone());
                let mut ok = ActionResult::ok(decision.id.clone(), decision.platform);
                ok.external_id = Some(format!("ext-{}", decision.id));
                ok
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn step_concurrency_is_bounded_per_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(Mutex::new((0usize, 0usize)));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(
            slow_submit(log, peak.clone(), std::time::Duration::from_millis(50)),
            sink(events),
            2,
        );

        // Five independent steps, concurrency capped at 2.
        let steps = (0..5)
            .map(|i| step(&format!("S{i}"), Platform::Drive, vec![]))
            .collect();
        let run = engine.run(spec(false, steps)).await.unwrap();

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.completed_steps.len(), 5);
        assert!(peak.lock().unwrap().1 <= 2, "peak {:?}", peak.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_finishes_in_flight_then_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(Mutex::new((0usize, 0usize)));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(
            slow_submit(log.clone(), peak, std::time::Duration::from_millis(100)),
            sink(events),
            1,
        );

        let workflow = spec(
            true,
            vec![
                step("A", Platform::Drive, vec![]),
                step("B", Platform::Sheets, vec!["A"]),
                step("C", Platform::Slack, vec!["B"]),
            ],
        );

        let runner = {
            let engine = engine.clone();
            let workflow = workflow.clone();
            tokio::spawn(async move { engine.run(workflow).await })
        };
        // Let A finish and B start, then cancel.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(engine.cancel("wf-1").await);

        let run = runner.await.unwrap().unwrap();
        assert!(run.cancelled);
        // B was in flight at cancel time and finished; C never started.
        assert_eq!(run.completed_steps, vec!["A", "B"]);
        assert_eq!(run.status, WorkflowStatus::RolledBack);
        let submitted: Vec<String> = log.lock().unwrap().iter().map(|d| d.id.clone()).collect();
        assert!(!submitted.contains(&"wf-1:C".to_string()));
        // Compensators for B then A ran through the submit callback.
        assert_eq!(run.compensation_results.len(), 2);
        assert_eq!(run.compensation_results[0].step, "B");

        assert!(!engine.cancel("wf-1").await, "token removed after finish");
    }

    #[tokio::test]
    async fn resume_skips_completed_and_fails_non_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = WorkflowEngine::new(
            recording_submit(log.clone(), vec![]),
            sink(events),
            4,
        );

        let mut steps = vec![
            step("A", Platform::Drive, vec![]),
            step("B", Platform::Sheets, vec!["A"]),
        ];
        steps[1].idempotent = false;
        let workflow = spec(true, steps);

        let mut prior_result = ActionResult::ok("wf-1:A", Platform::Drive);
        prior_result.external_id = Some("ext-A".to_string());
        let run = engine
            .resume(workflow, vec![("A".to_string(), prior_result)])
            .await
            .unwrap();

        // B is non-idempotent and incomplete: the run fails and A's
        // compensator executes with the journaled external id.
        assert_eq!(run.status, WorkflowStatus::RolledBack);
        assert_eq!(run.failed_step.as_deref(), Some("B"));
        let submitted = log.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0].compensates_external_id.as_deref(),
            Some("ext-A")
        );
    }
}
