use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use conductor_observability::redact_fields;
use conductor_platforms::{PlatformError, PlatformRegistry, PlatformResponse};
use conductor_types::{
    ActionAttempt, ActionDecision, ActionResult, AttemptOutcome, ErrorKind, EventPayload, Platform,
};

use crate::breaker::{BreakerRegistry, GateDecision};
use crate::config::{PlatformSettings, RetryConfig};
use crate::event_bus::EventBus;
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::journal::{Journal, JournalKind};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::router::derive_idempotency_key;

/// A finished execution: the terminal result plus every attempt made on the
/// way, for the owning record.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: ActionResult,
    pub attempts: Vec<ActionAttempt>,
}

/// Composes the per-platform reliability stages into a single `execute`:
/// idempotency admission, breaker gate, token acquisition, the adapter
/// attempt, jittered retry, and the fallback chain. Retriable errors are
/// fully absorbed here; callers only ever see terminal outcomes.
#[derive(Clone)]
pub struct ExecutorPipeline {
    registry: PlatformRegistry,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    retry_settings: PlatformSettings<RetryConfig>,
    idempotency: IdempotencyGuard,
    bus: EventBus,
    metrics: Arc<Metrics>,
    journal: Option<Arc<Journal>>,
    default_deadline: Duration,
}

impl ExecutorPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: PlatformRegistry,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        retry_settings: PlatformSettings<RetryConfig>,
        idempotency: IdempotencyGuard,
        bus: EventBus,
        metrics: Arc<Metrics>,
        journal: Option<Arc<Journal>>,
        default_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            breakers,
            retry_settings,
            idempotency,
            bus,
            metrics,
            journal,
            default_deadline,
        }
    }

    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    /// Run one action to a terminal result under its own deadline.
    pub async fn execute(&self, decision: &ActionDecision) -> ActionResult {
        self.execute_full(decision).await.result
    }

    /// Like [`execute`], also returning the attempt history.
    pub async fn execute_full(&self, decision: &ActionDecision) -> ExecutionOutcome {
        let deadline = Instant::now()
            + Duration::from_millis(
                decision
                    .timeout_ms
                    .unwrap_or(self.default_deadline.as_millis() as u64),
            );
        self.execute_with_deadline(decision, deadline).await
    }

    pub async fn execute_with_deadline(
        &self,
        decision: &ActionDecision,
        deadline: Instant,
    ) -> ExecutionOutcome {
        let key = decision
            .idempotency_key
            .clone()
            .unwrap_or_else(|| derive_idempotency_key(decision));

        match self.idempotency.admit(&key).await {
            Admission::Fresh => {}
            Admission::Cached(result) | Admission::Joined(result) => {
                Metrics::incr(&self.metrics.actions_deduplicated);
                debug!(action_id = %decision.id, key = %key, "served from idempotency guard");
                return ExecutionOutcome {
                    result: result.deduplicated_for(&decision.id),
                    attempts: Vec::new(),
                };
            }
        }

        let outcome = self.run_chain(decision, deadline).await;

        self.idempotency.complete(&key, outcome.result.clone()).await;
        if let Some(journal) = &self.journal {
            let masks = self
                .registry
                .redaction_masks(outcome.result.platform.unwrap_or(decision.platform))
                .await;
            let mut body = json!({"result": outcome.result, "actionId": decision.id});
            redact_fields(&mut body, &masks);
            journal.append(JournalKind::IdempotencyDone, &key, body);
        }
        outcome
    }

    /// Primary platform first, then each fallback in order. The breaker is
    /// consulted per candidate; an open breaker skips to the next platform.
    async fn run_chain(&self, decision: &ActionDecision, deadline: Instant) -> ExecutionOutcome {
        let mut attempts = Vec::new();
        let mut last_result: Option<ActionResult> = None;

        let mut chain = vec![decision.platform];
        chain.extend(decision.fallback_chain.iter().copied());

        for (index, &platform) in chain.iter().enumerate() {
            let is_fallback = index > 0;
            let params = if is_fallback {
                self.registry.map_params(
                    decision.action_type,
                    decision.platform,
                    platform,
                    &decision.params,
                )
            } else {
                decision.params.clone()
            };

            let mut result = self
                .run_attempts(decision, platform, &params, deadline, &mut attempts)
                .await;

            if result.is_ok() {
                if is_fallback {
                    Metrics::incr(&self.metrics.fallbacks_total);
                    result.used_fallback = true;
                    result.fallback_platform = Some(platform);
                }
                return ExecutionOutcome { result, attempts };
            }
            last_result = Some(result);
        }

        let mut result = last_result.unwrap_or_else(|| {
            ActionResult::failed(
                &decision.id,
                decision.platform,
                ErrorKind::Validation,
                "empty platform chain",
            )
        });
        result.used_fallback = chain.len() > 1;
        ExecutionOutcome { result, attempts }
    }

    /// Retry loop against one platform. Every attempt consults the breaker
    /// and takes a token before the adapter is touched.
    async fn run_attempts(
        &self,
        decision: &ActionDecision,
        platform: Platform,
        params: &Value,
        deadline: Instant,
        attempts: &mut Vec<ActionAttempt>,
    ) -> ActionResult {
        let Some(client) = self.registry.get(platform).await else {
            return ActionResult::failed(
                &decision.id,
                platform,
                ErrorKind::Validation,
                format!("no adapter registered for {platform}"),
            );
        };
        let breaker = self.breakers.breaker(platform);
        let bucket = self.limiter.bucket(platform);
        let policy = RetryPolicy::new(self.retry_settings.for_platform(platform));

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.bus.publish_payload(
                &decision.correlation_id,
                EventPayload::ActionStarted {
                    action_id: decision.id.clone(),
                    platform,
                    attempt,
                },
            );

            if breaker.gate() == GateDecision::ShortCircuit {
                Metrics::incr(&self.metrics.breaker_short_circuits);
                self.push_attempt(
                    attempts,
                    decision,
                    platform,
                    attempt,
                    AttemptOutcome::RejectedByBreaker,
                    Some(ErrorKind::BreakerOpen),
                );
                let mut result = ActionResult::failed(
                    &decision.id,
                    platform,
                    ErrorKind::BreakerOpen,
                    format!("circuit open for {platform}"),
                );
                result.attempts = attempt;
                return result;
            }

            if bucket.acquire(deadline).await.is_err() {
                self.push_attempt(
                    attempts,
                    decision,
                    platform,
                    attempt,
                    AttemptOutcome::Timeout,
                    Some(ErrorKind::Timeout),
                );
                if let Some(result) = self
                    .give_up_or_retry(
                        decision,
                        platform,
                        &policy,
                        attempt,
                        ErrorKind::Timeout,
                        "rate limiter acquire timed out",
                        deadline,
                        None,
                    )
                    .await
                {
                    return result;
                }
                continue;
            }

            let started = Instant::now();
            let call = async {
                match &decision.compensates_external_id {
                    Some(external_id) => {
                        client
                            .compensate(decision.action_type, external_id, params)
                            .await
                    }
                    None => client.execute(decision.action_type, params, deadline).await,
                }
            };
            let outcome: Result<PlatformResponse, PlatformError> =
                match tokio::time::timeout_at(deadline, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PlatformError::new(
                        ErrorKind::Timeout,
                        "action deadline exceeded",
                    )),
                };

            match outcome {
                Ok(response) => {
                    breaker.on_success();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.metrics.observe_latency(platform, elapsed_ms);
                    self.push_attempt(
                        attempts,
                        decision,
                        platform,
                        attempt,
                        AttemptOutcome::Success,
                        None,
                    );
                    let mut result = ActionResult::ok(&decision.id, platform);
                    result.value = Some(response.value);
                    result.external_id = response.external_id;
                    result.attempts = attempt;
                    return result;
                }
                Err(error) => {
                    breaker.on_failure(error.kind);
                    let outcome_kind = match error.kind {
                        ErrorKind::Timeout => AttemptOutcome::Timeout,
                        kind if kind.is_retriable() => AttemptOutcome::Transient,
                        _ => AttemptOutcome::Permanent,
                    };
                    self.push_attempt(
                        attempts,
                        decision,
                        platform,
                        attempt,
                        outcome_kind,
                        Some(error.kind),
                    );
                    let next_token = if error.kind == ErrorKind::RateLimit {
                        bucket.next_token_at()
                    } else {
                        None
                    };
                    if let Some(result) = self
                        .give_up_or_retry(
                            decision,
                            platform,
                            &policy,
                            attempt,
                            error.kind,
                            &error.message,
                            deadline,
                            next_token,
                        )
                        .await
                    {
                        return result;
                    }
                }
            }
        }
    }

    /// Decide between scheduling another attempt (returns `None` after the
    /// backoff sleep) and surfacing the last attempt's outcome.
    #[allow(clippy::too_many_arguments)]
    async fn give_up_or_retry(
        &self,
        decision: &ActionDecision,
        platform: Platform,
        policy: &RetryPolicy,
        attempt: u32,
        kind: ErrorKind,
        message: &str,
        deadline: Instant,
        next_token_at: Option<Instant>,
    ) -> Option<ActionResult> {
        if policy.should_retry(attempt, kind) {
            let delay = if kind == ErrorKind::RateLimit {
                policy.delay_after_rate_limit(attempt, next_token_at)
            } else {
                policy.delay_after(attempt)
            };
            if Instant::now() + delay < deadline {
                Metrics::incr(&self.metrics.retries_total);
                self.bus.publish_payload(
                    &decision.correlation_id,
                    EventPayload::ActionRetrying {
                        action_id: decision.id.clone(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error_kind: kind,
                    },
                );
                tokio::time::sleep(delay).await;
                return None;
            }
            warn!(
                action_id = %decision.id,
                platform = %platform,
                "backoff would exceed deadline; giving up"
            );
        }
        let mut result = ActionResult::failed(&decision.id, platform, kind, message);
        result.attempts = attempt;
        Some(result)
    }

    fn push_attempt(
        &self,
        attempts: &mut Vec<ActionAttempt>,
        decision: &ActionDecision,
        platform: Platform,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
    ) {
        let attempt = ActionAttempt {
            attempt_number,
            platform,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            outcome,
            error_kind,
        };
        if let Some(journal) = &self.journal {
            journal.append(
                JournalKind::ActionAttempt,
                &decision.id,
                json!({"attempt": attempt}),
            );
        }
        attempts.push(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RateLimiterConfig};
    use conductor_platforms::{MemoryPlatformClient, ScriptedOutcome};
    use conductor_types::{ActionType, Priority};
    use std::time::Duration;

    struct Harness {
        pipeline: ExecutorPipeline,
        bus: EventBus,
        notion: Arc<MemoryPlatformClient>,
        trello: Arc<MemoryPlatformClient>,
    }

    async fn harness() -> Harness {
        let bus = EventBus::new();
        let registry = PlatformRegistry::new();
        let notion = Arc::new(MemoryPlatformClient::new(Platform::Notion));
        let trello = Arc::new(MemoryPlatformClient::new(Platform::Trello));
        registry.register(notion.clone()).await;
        registry.register(trello.clone()).await;

        let mut rate_settings = PlatformSettings::<RateLimiterConfig>::default();
        rate_settings.default = RateLimiterConfig {
            capacity: 100.0,
            refill_per_sec: 100.0,
        };
        let mut breaker_settings = PlatformSettings::<BreakerConfig>::default();
        breaker_settings.default = BreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
            failure_window_ms: 60_000,
        };
        let mut retry_settings = PlatformSettings::<RetryConfig>::default();
        retry_settings.default = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: false,
        };

        let breakers = Arc::new(BreakerRegistry::new(&breaker_settings, bus.clone()));
        let limiter = Arc::new(RateLimiter::new(&rate_settings));
        let pipeline = ExecutorPipeline::new(
            registry,
            limiter,
            breakers,
            retry_settings,
            IdempotencyGuard::new(Duration::from_secs(3_600)),
            bus.clone(),
            Arc::new(Metrics::new()),
            None,
            Duration::from_secs(30),
        );
        Harness {
            pipeline,
            bus,
            notion,
            trello,
        }
    }

    fn decision(id: &str, platform: Platform) -> ActionDecision {
        ActionDecision {
            id: id.to_string(),
            correlation_id: format!("sig-{id}"),
            action_type: ActionType::CreateTask,
            platform,
            priority: Priority::Normal,
            params: json!({"title": "t"}),
            requires_approval: false,
            idempotency_key: Some(format!("ik-{id}")),
            fallback_chain: Vec::new(),
            timeout_ms: None,
            approved_by: None,
            compensates_external_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_external_id_and_one_attempt() {
        let h = harness().await;
        let result = h.pipeline.execute(&decision("a1", Platform::Notion)).await;
        assert!(result.is_ok());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.external_id.as_deref(), Some("notion-1"));
        assert!(!result.used_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds_with_events() {
        let h = harness().await;
        h.notion
            .push_outcome(ScriptedOutcome::fail(ErrorKind::Timeout, "slow"))
            .await;
        let mut rx = h.bus.subscribe();

        let outcome = h
            .pipeline
            .execute_full(&decision("a1", Platform::Notion))
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.result.attempts, 2);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Success);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.payload.kind());
        }
        assert_eq!(
            kinds,
            vec!["action:started", "action:retrying", "action:started"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let h = harness().await;
        h.notion
            .push_outcome(ScriptedOutcome::fail(ErrorKind::Auth, "401"))
            .await;
        let result = h.pipeline.execute(&decision("a1", Platform::Notion)).await;
        assert!(!result.is_ok());
        assert_eq!(result.error_kind, Some(ErrorKind::Auth));
        assert_eq!(result.attempts, 1);
        assert_eq!(h.notion.call_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhausts_and_surfaces_last_outcome() {
        let h = harness().await;
        for _ in 0..3 {
            h.notion
                .push_outcome(ScriptedOutcome::fail(ErrorKind::Transient, "reset"))
                .await;
        }
        let result = h.pipeline.execute(&decision("a1", Platform::Notion)).await;
        assert!(!result.is_ok());
        assert_eq!(result.error_kind, Some(ErrorKind::Transient));
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_chain_reaches_second_platform() {
        let h = harness().await;
        for _ in 0..3 {
            h.notion
                .push_outcome(ScriptedOutcome::fail(
                    ErrorKind::ServiceUnavailable,
                    "maintenance",
                ))
                .await;
        }
        let mut d = decision("a1", Platform::Notion);
        d.fallback_chain = vec![Platform::Trello];
        let result = h.pipeline.execute(&d).await;

        assert!(result.is_ok());
        assert!(result.used_fallback);
        assert_eq!(result.fallback_platform, Some(Platform::Trello));
        assert_eq!(result.platform, Some(Platform::Trello));
        assert_eq!(h.trello.call_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_params_are_mapped_between_dialects() {
        let h = harness().await;
        h.notion
            .push_outcome(ScriptedOutcome::fail(ErrorKind::Auth, "401"))
            .await;
        let mut d = decision("a1", Platform::Notion);
        d.params = json!({"title": "t", "status_property": "In Review"});
        d.fallback_chain = vec![Platform::Trello];
        let result = h.pipeline.execute(&d).await;
        assert!(result.is_ok());

        let calls = h.trello.recorded_calls().await;
        assert_eq!(calls[0].params["list_id"], "In Review");
        assert!(calls[0].params.get("status_property").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_adapter_call() {
        let h = harness().await;
        // Five prior failures trip the notion breaker.
        for i in 0..5 {
            h.notion
                .push_outcome(ScriptedOutcome::fail(
                    ErrorKind::ServiceUnavailable,
                    "maintenance",
                ))
                .await;
            let d = decision(&format!("warm-{i}"), Platform::Notion);
            let _ = h.pipeline.execute(&d).await;
        }
        let calls_before = h.notion.call_count().await;

        let mut d = decision("focal", Platform::Notion);
        d.fallback_chain = vec![Platform::Trello];
        let result = h.pipeline.execute(&d).await;

        assert!(result.is_ok());
        assert!(result.used_fallback);
        // The open breaker let no further notion call through.
        assert_eq!(h.notion.call_count().await, calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_key_joins_single_execution() {
        let h = harness().await;
        h.notion
            .push_outcome(ScriptedOutcome::ok("page-789").after(Duration::from_millis(100)))
            .await;

        let first = {
            let pipeline = h.pipeline.clone();
            let d = decision("a1", Platform::Notion);
            tokio::spawn(async move { pipeline.execute(&d).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut second_decision = decision("a2", Platform::Notion);
        second_decision.idempotency_key = Some("ik-a1".to_string());
        let second = h.pipeline.execute(&second_decision).await;
        let first = first.await.unwrap();

        assert_eq!(first.external_id.as_deref(), Some("page-789"));
        assert_eq!(second.external_id.as_deref(), Some("page-789"));
        assert!(second.deduplicated);
        assert_eq!(second.origin_action_id.as_deref(), Some("a1"));
        assert_eq!(h.notion.call_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn compensation_decisions_use_the_compensate_entry_point() {
        let h = harness().await;
        let mut d = decision("a1", Platform::Notion);
        d.compensates_external_id = Some("page-789".to_string());
        let result = h.pipeline.execute(&d).await;
        assert!(result.is_ok());

        let calls = h.notion.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].compensation);
        assert_eq!(calls[0].params["external_id"], "page-789");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_yields_timeout() {
        let h = harness().await;
        h.notion
            .push_outcome(ScriptedOutcome::ok("late").after(Duration::from_secs(60)))
            .await;
        let mut d = decision("a1", Platform::Notion);
        d.timeout_ms = Some(50);
        let result = h.pipeline.execute(&d).await;
        assert!(!result.is_ok());
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }
}
