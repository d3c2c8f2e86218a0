use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use conductor_types::{ActionType, Platform, Priority};

/// Per-platform settings with a shared default: `for_platform` falls back to
/// `default` when no override exists.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformSettings<T: Clone + Default> {
    #[serde(default)]
    pub default: T,
    #[serde(default)]
    pub platforms: HashMap<Platform, T>,
}

impl<T: Clone + Default> PlatformSettings<T> {
    pub fn for_platform(&self, platform: Platform) -> T {
        self.platforms
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkersConfig {
    pub count: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_size: usize,
    /// After this many consecutive dequeues from the same top lane while
    /// lower-priority work waits, one dequeue is forced from the next lane.
    pub starvation_guard_k: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1024,
            starvation_guard_k: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    pub failure_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
            failure_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    Reject,
}

impl Default for TimeoutAction {
    fn default() -> Self {
        TimeoutAction::Reject
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApprovalConfig {
    pub default_timeout_ms: u64,
    pub default_timeout_action: TimeoutAction,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 900_000,
            default_timeout_action: TimeoutAction::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_ms: 3_600_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub flush_every_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("conductor-journal.jsonl"),
            flush_every_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub concurrency_per_run: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency_per_run: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeadlinesConfig {
    pub default_action_ms: u64,
}

impl Default for DeadlinesConfig {
    fn default() -> Self {
        Self {
            default_action_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    /// Optional per-type priority ceiling. Claims above the ceiling are
    /// downgraded; the router never upgrades.
    pub max_priority_by_type: HashMap<ActionType, Priority>,
}

/// Full configuration tree. Every knob has a default; nothing is
/// hard-coded at use sites.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub workers: WorkersConfig,
    pub queue: QueueConfig,
    pub breaker: PlatformSettings<BreakerConfig>,
    pub rate_limiter: PlatformSettings<RateLimiterConfig>,
    pub retry: PlatformSettings<RetryConfig>,
    pub approval: ApprovalConfig,
    pub idempotency: IdempotencyConfig,
    pub journal: JournalConfig,
    pub workflow: WorkflowConfig,
    pub deadlines: DeadlinesConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

/// Layered configuration: file, then environment (`CONDUCTOR_` prefix,
/// `__` as path separator), then runtime overrides. Later layers win.
#[derive(Clone)]
pub struct ConfigStore {
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => match fs::read(path).await {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(_) => empty_object(),
            },
            None => empty_object(),
        };

        let layers = ConfigLayers {
            file,
            env: env_layer("CONDUCTOR_"),
            runtime: empty_object(),
        };

        Ok(Self {
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn from_value(value: Value) -> Self {
        Self {
            layers: Arc::new(RwLock::new(ConfigLayers {
                file: value,
                env: empty_object(),
                runtime: empty_object(),
            })),
        }
    }

    pub async fn get(&self) -> OrchestratorConfig {
        let merged = self.effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    /// Merge an override into the runtime layer.
    pub async fn set_runtime(&self, value: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &value);
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                deep_merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target_slot, source_value) => {
            if !source_value.is_null() {
                *target_slot = source_value.clone();
            }
        }
    }
}

/// `CONDUCTOR_QUEUE__MAX_SIZE=2048` becomes `{"queue": {"maxSize": 2048}}`.
fn env_layer(prefix: &str) -> Value {
    let mut layer = empty_object();
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let segments: Vec<String> = rest
            .split("__")
            .map(|s| snake_to_camel(&s.to_lowercase()))
            .collect();
        if segments.is_empty() {
            continue;
        }
        let parsed: Value =
            serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
        let mut nested = parsed;
        for segment in segments.iter().rev() {
            let mut obj = Map::new();
            obj.insert(segment.clone(), nested);
            nested = Value::Object(obj);
        }
        deep_merge(&mut layer, &nested);
    }
    layer
}

fn snake_to_camel(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for ch in input.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_complete() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.queue.max_size, 1024);
        assert_eq!(config.queue.starvation_guard_k, 16);
        assert_eq!(config.breaker.default.failure_threshold, 5);
        assert_eq!(config.approval.default_timeout_action, TimeoutAction::Reject);
        assert!(!config.journal.enabled);
    }

    #[test]
    fn platform_override_falls_back_to_default() {
        let config: OrchestratorConfig = serde_json::from_value(json!({
            "breaker": {
                "default": {"failureThreshold": 3},
                "platforms": {"notion": {"failureThreshold": 7}}
            }
        }))
        .unwrap();
        assert_eq!(
            config.breaker.for_platform(Platform::Notion).failure_threshold,
            7
        );
        assert_eq!(
            config.breaker.for_platform(Platform::Slack).failure_threshold,
            3
        );
        // Unspecified fields in an override fall back to the field default.
        assert_eq!(
            config.breaker.for_platform(Platform::Notion).success_threshold,
            2
        );
    }

    #[test]
    fn deep_merge_overrides_nested_keys() {
        let mut base = json!({"queue": {"maxSize": 1024, "starvationGuardK": 16}});
        deep_merge(&mut base, &json!({"queue": {"maxSize": 64}}));
        assert_eq!(base["queue"]["maxSize"], 64);
        assert_eq!(base["queue"]["starvationGuardK"], 16);
    }

    #[tokio::test]
    async fn runtime_layer_wins_over_file() {
        let store = ConfigStore::from_value(json!({"workers": {"count": 2}}));
        assert_eq!(store.get().await.workers.count, 2);
        store.set_runtime(json!({"workers": {"count": 8}})).await;
        assert_eq!(store.get().await.workers.count, 8);
    }

    #[test]
    fn snake_to_camel_converts_paths() {
        assert_eq!(snake_to_camel("max_size"), "maxSize");
        assert_eq!(snake_to_camel("count"), "count");
        assert_eq!(snake_to_camel("default_timeout_ms"), "defaultTimeoutMs");
    }
}
