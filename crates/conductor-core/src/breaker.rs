use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use conductor_types::{BreakerCounters, ErrorKind, EventPayload, Platform};

use crate::config::{BreakerConfig, PlatformSettings};
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Decision returned by [`CircuitBreaker::gate`] before each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    ShortCircuit,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    failure_window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// Per-platform health snapshot used by metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    #[serde(flatten)]
    pub counters: BreakerCounters,
}

/// Per-platform three-state availability gate. Failures classified as
/// client-side never feed the window; an open breaker fast-fails callers
/// until the reset timeout converts it to half-open probing.
pub struct CircuitBreaker {
    platform: Platform,
    config: BreakerConfig,
    inner: StdMutex<BreakerInner>,
    bus: EventBus,
}

impl CircuitBreaker {
    pub fn new(platform: Platform, config: BreakerConfig, bus: EventBus) -> Self {
        Self {
            platform,
            config,
            inner: StdMutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                failure_window: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
            bus,
        }
    }

    /// Consulted before every attempt, including retries.
    pub fn gate(&self) -> GateDecision {
        let transition;
        let decision;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                BreakerState::Closed | BreakerState::HalfOpen => {
                    transition = None;
                    decision = GateDecision::Allow;
                }
                BreakerState::Open => {
                    let reset_after = Duration::from_millis(self.config.reset_timeout_ms);
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= reset_after {
                        inner.state = BreakerState::HalfOpen;
                        inner.half_open_successes = 0;
                        transition = Some(self.transition_event(&inner));
                        decision = GateDecision::Allow;
                    } else {
                        transition = None;
                        decision = GateDecision::ShortCircuit;
                    }
                }
            }
        }
        if let Some(event) = transition {
            self.publish(event);
        }
        decision
    }

    pub fn on_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                BreakerState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.state = BreakerState::Closed;
                        inner.consecutive_failures = 0;
                        inner.failure_window.clear();
                        inner.opened_at = None;
                        Some(self.transition_event(&inner))
                    } else {
                        None
                    }
                }
                // A success landing after the breaker re-opened is stale.
                BreakerState::Open => None,
            }
        };
        if let Some(event) = transition {
            self.publish(event);
        }
    }

    pub fn on_failure(&self, kind: ErrorKind) {
        if !kind.counts_toward_breaker() {
            return;
        }
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            inner.consecutive_failures += 1;
            match inner.state {
                BreakerState::Closed => {
                    inner.failure_window.push_back(now);
                    let window = Duration::from_millis(self.config.failure_window_ms);
                    while let Some(&front) = inner.failure_window.front() {
                        if now.saturating_duration_since(front) > window {
                            inner.failure_window.pop_front();
                        } else {
                            break;
                        }
                    }
                    if inner.failure_window.len() >= self.config.failure_threshold as usize {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(now);
                        Some(self.transition_event(&inner))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    // One failed probe re-opens.
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.half_open_successes = 0;
                    Some(self.transition_event(&inner))
                }
                BreakerState::Open => None,
            }
        };
        if let Some(event) = transition {
            self.publish(event);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BreakerSnapshot {
            state: inner.state,
            counters: BreakerCounters {
                consecutive_failures: inner.consecutive_failures,
                window_len: inner.failure_window.len(),
                half_open_successes: inner.half_open_successes,
            },
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    fn transition_event(&self, inner: &BreakerInner) -> EventPayload {
        let counters = BreakerCounters {
            consecutive_failures: inner.consecutive_failures,
            window_len: inner.failure_window.len(),
            half_open_successes: inner.half_open_successes,
        };
        match inner.state {
            BreakerState::Open => EventPayload::CircuitOpened {
                platform: self.platform,
                counters,
            },
            BreakerState::Closed => EventPayload::CircuitClosed {
                platform: self.platform,
                counters,
            },
            BreakerState::HalfOpen => EventPayload::CircuitHalfOpen {
                platform: self.platform,
                counters,
            },
        }
    }

    fn publish(&self, payload: EventPayload) {
        self.bus.publish_payload(self.platform.as_str(), payload);
    }
}

/// One breaker per platform, built once from configuration.
pub struct BreakerRegistry {
    breakers: HashMap<Platform, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: &PlatformSettings<BreakerConfig>, bus: EventBus) -> Self {
        let breakers = Platform::ALL
            .iter()
            .map(|&platform| {
                (
                    platform,
                    Arc::new(CircuitBreaker::new(
                        platform,
                        settings.for_platform(platform),
                        bus.clone(),
                    )),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn breaker(&self, platform: Platform) -> Arc<CircuitBreaker> {
        self.breakers[&platform].clone()
    }

    pub fn snapshots(&self) -> HashMap<Platform, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|(&platform, breaker)| (platform, breaker.snapshot()))
            .collect()
    }
}
