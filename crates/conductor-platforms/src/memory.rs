use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use conductor_types::{ActionType, ErrorKind, Platform};

use crate::client::{PlatformClient, PlatformError, PlatformResponse};

/// One programmed outcome for the next call against a [`MemoryPlatformClient`].
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub delay: Option<Duration>,
    pub result: Result<PlatformResponse, PlatformError>,
}

impl ScriptedOutcome {
    pub fn ok(external_id: impl Into<String>) -> Self {
        Self {
            delay: None,
            result: Ok(PlatformResponse::with_external_id(external_id)),
        }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            delay: None,
            result: Err(PlatformError::new(kind, message)),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A call observed by the in-memory client.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub action_type: ActionType,
    pub params: Value,
    pub compensation: bool,
    pub external_id: Option<String>,
}

/// Scriptable in-memory platform adapter. With an empty script every call
/// succeeds with a generated external id; scripted outcomes are consumed
/// FIFO. All calls are recorded for assertions.
pub struct MemoryPlatformClient {
    platform: Platform,
    masks: Vec<String>,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    healthy: AtomicBool,
    sequence: AtomicU64,
}

impl MemoryPlatformClient {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            masks: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_masks(mut self, masks: &[&str]) -> Self {
        self.masks = masks.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub async fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    pub async fn push_outcomes(&self, outcomes: Vec<ScriptedOutcome>) {
        let mut script = self.script.lock().await;
        for outcome in outcomes {
            script.push_back(outcome);
        }
    }

    pub async fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    fn next_external_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.platform, n)
    }

    async fn run_scripted(
        &self,
        action_type: ActionType,
        params: &Value,
        deadline: Instant,
        compensation: bool,
    ) -> Result<PlatformResponse, PlatformError> {
        let scripted = self.script.lock().await.pop_front();
        let outcome = scripted.unwrap_or_else(|| ScriptedOutcome::ok(self.next_external_id()));

        if let Some(delay) = outcome.delay {
            let wake = Instant::now() + delay;
            if wake >= deadline {
                tokio::time::sleep_until(deadline).await;
                self.calls.lock().await.push(RecordedCall {
                    action_type,
                    params: params.clone(),
                    compensation,
                    external_id: None,
                });
                return Err(PlatformError::new(
                    ErrorKind::Timeout,
                    "deadline exceeded before adapter responded",
                ));
            }
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().await.push(RecordedCall {
            action_type,
            params: params.clone(),
            compensation,
            external_id: outcome
                .result
                .as_ref()
                .ok()
                .and_then(|r| r.external_id.clone()),
        });
        outcome.result
    }
}

#[async_trait]
impl PlatformClient for MemoryPlatformClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn redaction_masks(&self) -> Vec<String> {
        self.masks.clone()
    }

    async fn execute(
        &self,
        action_type: ActionType,
        params: &Value,
        deadline: Instant,
    ) -> Result<PlatformResponse, PlatformError> {
        self.run_scripted(action_type, params, deadline, false).await
    }

    async fn health_check(&self) -> Result<(), PlatformError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PlatformError::new(
                ErrorKind::ServiceUnavailable,
                format!("{} marked unhealthy", self.platform),
            ))
        }
    }

    async fn compensate(
        &self,
        action_type: ActionType,
        external_id: &str,
        params: &Value,
    ) -> Result<PlatformResponse, PlatformError> {
        let mut merged = params.clone();
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("external_id".to_string(), json!(external_id));
        }
        self.run_scripted(action_type, &merged, Instant::now() + Duration::from_secs(30), true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_script_succeeds_with_generated_id() {
        let client = MemoryPlatformClient::new(Platform::Notion);
        let response = client
            .execute(
                ActionType::CreateTask,
                &json!({"title": "t"}),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.external_id.as_deref(), Some("notion-1"));
        assert_eq!(client.call_count().await, 1);
    }

    #[tokio::test]
    async fn scripted_outcomes_consumed_in_order() {
        let client = MemoryPlatformClient::new(Platform::Sheets);
        client
            .push_outcomes(vec![
                ScriptedOutcome::fail(ErrorKind::Timeout, "slow"),
                ScriptedOutcome::ok("row-2"),
            ])
            .await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let first = client
            .execute(ActionType::AppendRow, &json!({}), deadline)
            .await;
        assert_eq!(first.unwrap_err().kind, ErrorKind::Timeout);

        let second = client
            .execute(ActionType::AppendRow, &json!({}), deadline)
            .await
            .unwrap();
        assert_eq!(second.external_id.as_deref(), Some("row-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_outcome_past_deadline_times_out() {
        let client = MemoryPlatformClient::new(Platform::Drive);
        client
            .push_outcome(ScriptedOutcome::ok("file-1").after(Duration::from_secs(10)))
            .await;

        let result = client
            .execute(
                ActionType::FileDocument,
                &json!({}),
                Instant::now() + Duration::from_secs(1),
            )
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn compensate_merges_external_id_and_is_recorded() {
        let client = MemoryPlatformClient::new(Platform::Drive);
        client
            .compensate(ActionType::FileDocument, "file-9", &json!({"folder": "x"}))
            .await
            .unwrap();
        let calls = client.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].compensation);
        assert_eq!(calls[0].params["external_id"], "file-9");
    }
}
