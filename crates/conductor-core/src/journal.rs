use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use conductor_types::{ActionResult, WorkflowSpec};

/// Record kinds in the append-only journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    ActionAdmitted,
    ActionAttempt,
    ActionTerminal,
    WorkflowStep,
    ReviewTransition,
    IdempotencyDone,
}

/// One journal line: a typed envelope around an opaque body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub kind: JournalKind,
    pub id: String,
    pub ts: DateTime<Utc>,
    pub body: Value,
}

enum WriterMsg {
    Record(JournalRecord),
    Shutdown(oneshot::Sender<()>),
}

/// Append-only JSONL journal. Appends are fire-and-forget through an
/// unbounded channel; a background writer batches lines and flushes on a
/// timer so the execution plane never blocks on disk.
pub struct Journal {
    tx: mpsc::UnboundedSender<WriterMsg>,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>, flush_every: Duration) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), rx, flush_every));
        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, kind: JournalKind, id: impl Into<String>, body: Value) {
        let record = JournalRecord {
            kind,
            id: id.into(),
            ts: Utc::now(),
            body,
        };
        let _ = self.tx.send(WriterMsg::Record(record));
    }

    /// Flush buffered records and stop the writer.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Read every parseable record; malformed lines are skipped with a
    /// warning rather than failing recovery.
    pub async fn read_all(path: &Path) -> anyhow::Result<Vec<JournalRecord>> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(line = line_no + 1, error = %err, "skipping malformed journal line")
                }
            }
        }
        Ok(records)
    }
}

async fn writer_task(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    flush_every: Duration,
) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "journal disabled: cannot open file");
            // Drain so senders never notice.
            while let Some(msg) = rx.recv().await {
                if let WriterMsg::Shutdown(ack) = msg {
                    let _ = ack.send(());
                    return;
                }
            }
            return;
        }
    };

    let mut writer = tokio::io::BufWriter::new(file);
    let mut ticker = tokio::time::interval(flush_every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMsg::Record(record)) => {
                    if let Ok(mut line) = serde_json::to_vec(&record) {
                        line.push(b'\n');
                        let _ = writer.write_all(&line).await;
                    }
                }
                Some(WriterMsg::Shutdown(ack)) => {
                    let _ = writer.flush().await;
                    let _ = ack.send(());
                    return;
                }
                None => {
                    let _ = writer.flush().await;
                    return;
                }
            },
            _ = ticker.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}

/// A `running` workflow reconstructed from the journal, ready to resume.
#[derive(Debug, Clone)]
pub struct WorkflowResume {
    pub spec: WorkflowSpec,
    pub completed: Vec<(String, ActionResult)>,
}

/// Everything the startup path replays out of the journal.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// `(key, result, age)` for idempotency entries still inside the TTL.
    pub idempotency: Vec<(String, ActionResult, Duration)>,
    pub workflows: Vec<WorkflowResume>,
    pub skipped_stale: usize,
}

/// Summary logged and surfaced through health after recovery runs.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub idempotency_restored: usize,
    pub workflows_resumed: usize,
    pub skipped_stale: usize,
}

/// Fold journal records into a recovery plan. Records older than the
/// idempotency TTL are skipped; workflows with a terminal record are not
/// resumed.
pub fn build_recovery_plan(
    records: &[JournalRecord],
    ttl: Duration,
    now: DateTime<Utc>,
) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();
    let mut submitted: HashMap<String, WorkflowSpec> = HashMap::new();
    let mut completed_steps: HashMap<String, Vec<(String, ActionResult)>> = HashMap::new();
    let mut finished: Vec<String> = Vec::new();

    for record in records {
        match record.kind {
            JournalKind::IdempotencyDone => {
                let age = (now - record.ts)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age >= ttl {
                    plan.skipped_stale += 1;
                    continue;
                }
                let Ok(result) =
                    serde_json::from_value::<ActionResult>(record.body["result"].clone())
                else {
                    plan.skipped_stale += 1;
                    continue;
                };
                plan.idempotency.push((record.id.clone(), result, age));
            }
            JournalKind::WorkflowStep => {
                match record.body["phase"].as_str().unwrap_or_default() {
                    "submitted" => {
                        if let Ok(spec) =
                            serde_json::from_value::<WorkflowSpec>(record.body["spec"].clone())
                        {
                            submitted.insert(record.id.clone(), spec);
                        }
                    }
                    "step_completed" => {
                        let step = record.body["step"].as_str().unwrap_or_default().to_string();
                        if let Ok(result) =
                            serde_json::from_value::<ActionResult>(record.body["result"].clone())
                        {
                            completed_steps
                                .entry(record.id.clone())
                                .or_default()
                                .push((step, result));
                        }
                    }
                    "finished" => finished.push(record.id.clone()),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    for (workflow_id, spec) in submitted {
        if finished.contains(&workflow_id) {
            continue;
        }
        let completed = completed_steps.remove(&workflow_id).unwrap_or_default();
        plan.workflows.push(WorkflowResume { spec, completed });
    }

    plan
}

impl RecoveryPlan {
    pub fn report(&self) -> RecoveryReport {
        RecoveryReport {
            idempotency_restored: self.idempotency.len(),
            workflows_resumed: self.workflows.len(),
            skipped_stale: self.skipped_stale,
        }
    }

    pub fn log(&self) {
        let report = self.report();
        info!(
            idempotency_restored = report.idempotency_restored,
            workflows_resumed = report.workflows_resumed,
            skipped_stale = report.skipped_stale,
            "journal recovery complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{ActionType, Platform, Priority, StepSpec};

    fn result(id: &str) -> ActionResult {
        ActionResult::ok(id, Platform::Notion)
    }

    #[tokio::test]
    async fn append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&path, Duration::from_millis(20));

        journal.append(
            JournalKind::ActionAdmitted,
            "a1",
            json!({"platform": "notion"}),
        );
        journal.append(
            JournalKind::IdempotencyDone,
            "ik-1",
            json!({"result": result("a1")}),
        );
        journal.shutdown().await;

        let records = Journal::read_all(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, JournalKind::ActionAdmitted);
        assert_eq!(records[1].id, "ik-1");
    }

    #[tokio::test]
    async fn read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&path, Duration::from_millis(20));
        journal.append(JournalKind::ActionTerminal, "a1", json!({}));
        journal.shutdown().await;

        let mut raw = fs::read_to_string(&path).await.unwrap();
        raw.push_str("{not json\n");
        fs::write(&path, raw).await.unwrap();

        let records = Journal::read_all(&path).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = Journal::read_all(&dir.path().join("absent.jsonl"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn recovery_plan_restores_fresh_and_skips_stale() {
        let now = Utc::now();
        let records = vec![
            JournalRecord {
                kind: JournalKind::IdempotencyDone,
                id: "ik-fresh".to_string(),
                ts: now - chrono::Duration::seconds(10),
                body: json!({"result": result("a1")}),
            },
            JournalRecord {
                kind: JournalKind::IdempotencyDone,
                id: "ik-stale".to_string(),
                ts: now - chrono::Duration::hours(3),
                body: json!({"result": result("a2")}),
            },
        ];
        let plan = build_recovery_plan(&records, Duration::from_secs(3_600), now);
        assert_eq!(plan.idempotency.len(), 1);
        assert_eq!(plan.idempotency[0].0, "ik-fresh");
        assert_eq!(plan.skipped_stale, 1);
    }

    #[test]
    fn recovery_plan_resumes_unfinished_workflows() {
        let now = Utc::now();
        let spec = WorkflowSpec {
            workflow_id: "wf-1".to_string(),
            correlation_id: "sig-1".to_string(),
            idempotency_key: "wf-ik-1".to_string(),
            transactional: true,
            steps: vec![StepSpec {
                name: "A".to_string(),
                action_type: ActionType::Log,
                platform: Platform::Slack,
                params: json!({}),
                depends_on: Vec::new(),
                on_compensate: None,
                idempotent: true,
                priority: Priority::Normal,
                fallback_chain: Vec::new(),
            }],
        };
        let records = vec![
            JournalRecord {
                kind: JournalKind::WorkflowStep,
                id: "wf-1".to_string(),
                ts: now,
                body: json!({"phase": "submitted", "spec": spec}),
            },
            JournalRecord {
                kind: JournalKind::WorkflowStep,
                id: "wf-1".to_string(),
                ts: now,
                body: json!({"phase": "step_completed", "step": "A", "result": result("wf-1:A")}),
            },
            JournalRecord {
                kind: JournalKind::WorkflowStep,
                id: "wf-2".to_string(),
                ts: now,
                body: json!({"phase": "submitted", "spec": {
                    "workflowId": "wf-2", "idempotencyKey": "k2", "steps": spec.steps
                }}),
            },
            JournalRecord {
                kind: JournalKind::WorkflowStep,
                id: "wf-2".to_string(),
                ts: now,
                body: json!({"phase": "finished", "status": "completed"}),
            },
        ];

        let plan = build_recovery_plan(&records, Duration::from_secs(3_600), now);
        assert_eq!(plan.workflows.len(), 1);
        assert_eq!(plan.workflows[0].spec.workflow_id, "wf-1");
        assert_eq!(plan.workflows[0].completed.len(), 1);
        let report = plan.report();
        assert_eq!(report.workflows_resumed, 1);
    }
}
