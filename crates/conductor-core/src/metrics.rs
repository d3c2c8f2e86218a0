use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use conductor_types::Platform;

use crate::breaker::BreakerSnapshot;

/// Upper bounds (ms) of the latency histogram buckets; the last bucket is
/// open-ended.
pub const LATENCY_BUCKETS_MS: [u64; 9] = [5, 10, 25, 50, 100, 250, 500, 1_000, 5_000];

#[derive(Debug, Default)]
struct Histogram {
    counts: [u64; LATENCY_BUCKETS_MS.len() + 1],
    total_ms: u64,
    samples: u64,
}

impl Histogram {
    fn observe(&mut self, ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counts[idx] += 1;
        self.total_ms += ms;
        self.samples += 1;
    }
}

/// Serialized view of one platform's latency distribution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub samples: u64,
    pub mean_ms: f64,
}

/// Process-wide counters and per-platform latency histograms. Everything is
/// lock-free except histogram updates, which sit behind a short std lock.
#[derive(Default)]
pub struct Metrics {
    pub actions_admitted: AtomicU64,
    pub actions_completed: AtomicU64,
    pub actions_failed: AtomicU64,
    pub actions_rejected: AtomicU64,
    pub actions_deduplicated: AtomicU64,
    pub retries_total: AtomicU64,
    pub fallbacks_total: AtomicU64,
    pub evictions_total: AtomicU64,
    pub breaker_short_circuits: AtomicU64,
    pub approvals_requested: AtomicU64,
    pub approvals_timed_out: AtomicU64,
    pub workflows_completed: AtomicU64,
    pub workflows_rolled_back: AtomicU64,
    latency: StdMutex<HashMap<Platform, Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, platform: Platform, ms: u64) {
        let mut latency = self.latency.lock().unwrap_or_else(|e| e.into_inner());
        latency.entry(platform).or_default().observe(ms);
    }

    pub fn latency_snapshot(&self) -> HashMap<Platform, LatencySnapshot> {
        let latency = self.latency.lock().unwrap_or_else(|e| e.into_inner());
        latency
            .iter()
            .map(|(&platform, hist)| {
                (
                    platform,
                    LatencySnapshot {
                        buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
                        counts: hist.counts.to_vec(),
                        samples: hist.samples,
                        mean_ms: if hist.samples == 0 {
                            0.0
                        } else {
                            hist.total_ms as f64 / hist.samples as f64
                        },
                    },
                )
            })
            .collect()
    }
}

/// Point-in-time view of the orchestrator's health, exposed to embedders
/// and logged on shutdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queue_depth: usize,
    pub inflight_actions: usize,
    pub breakers: HashMap<Platform, BreakerSnapshot>,
    pub bucket_levels: HashMap<Platform, (f64, f64)>,
    pub counters: HashMap<String, u64>,
    pub latency: HashMap<Platform, LatencySnapshot>,
    pub bus_lagged: u64,
}

impl Metrics {
    pub fn counters_map(&self) -> HashMap<String, u64> {
        let mut map = HashMap::new();
        map.insert(
            "actions_admitted".to_string(),
            self.actions_admitted.load(Ordering::Relaxed),
        );
        map.insert(
            "actions_completed".to_string(),
            self.actions_completed.load(Ordering::Relaxed),
        );
        map.insert(
            "actions_failed".to_string(),
            self.actions_failed.load(Ordering::Relaxed),
        );
        map.insert(
            "actions_rejected".to_string(),
            self.actions_rejected.load(Ordering::Relaxed),
        );
        map.insert(
            "actions_deduplicated".to_string(),
            self.actions_deduplicated.load(Ordering::Relaxed),
        );
        map.insert(
            "retries_total".to_string(),
            self.retries_total.load(Ordering::Relaxed),
        );
        map.insert(
            "fallbacks_total".to_string(),
            self.fallbacks_total.load(Ordering::Relaxed),
        );
        map.insert(
            "evictions_total".to_string(),
            self.evictions_total.load(Ordering::Relaxed),
        );
        map.insert(
            "breaker_short_circuits".to_string(),
            self.breaker_short_circuits.load(Ordering::Relaxed),
        );
        map.insert(
            "approvals_requested".to_string(),
            self.approvals_requested.load(Ordering::Relaxed),
        );
        map.insert(
            "approvals_timed_out".to_string(),
            self.approvals_timed_out.load(Ordering::Relaxed),
        );
        map.insert(
            "workflows_completed".to_string(),
            self.workflows_completed.load(Ordering::Relaxed),
        );
        map.insert(
            "workflows_rolled_back".to_string(),
            self.workflows_rolled_back.load(Ordering::Relaxed),
        );
        map
    }
}
