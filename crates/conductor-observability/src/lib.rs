use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rotated files are named `<LOG_PREFIX>.YYYY-MM-DD`.
const LOG_PREFIX: &str = "conductor.log";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Replace a sensitive string with a fingerprint that is safe to log: the
/// first 8 bytes of its sha256 plus its length, never the content.
pub fn redact_text(input: &str) -> String {
    let content = input.trim();
    if content.is_empty() {
        return String::new();
    }
    format!("[redacted:{}:{}b]", short_hash(content), content.len())
}

pub fn short_hash(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..8])
}

/// Redact every field named in `masks` anywhere inside `value`, in place.
/// Used on event payloads and journal bodies before they leave the process;
/// adapters declare the masks.
pub fn redact_fields(value: &mut Value, masks: &[String]) {
    if masks.is_empty() {
        return;
    }
    match value {
        Value::Object(obj) => {
            for (key, child) in obj.iter_mut() {
                if masks.iter().any(|m| m == key) {
                    let raw = match &*child {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    *child = Value::String(redact_text(&raw));
                } else {
                    redact_fields(child, masks);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_fields(item, masks);
            }
        }
        _ => {}
    }
}

/// Initialize process logging: a JSON layer into a daily-rotated file plus
/// a compact console layer, both filtered by `RUST_LOG` (default `info`).
/// Rotated files older than the retention window are pruned first.
pub fn init_logging(
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let pruned_files = prune_rotated_logs(logs_dir, retention_days);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_PREFIX));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(writer),
        )
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            logs_dir: logs_dir.to_path_buf(),
            file_prefix: LOG_PREFIX.to_string(),
            retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    ))
}

/// Best-effort removal of rotated log files whose date stamp falls before
/// the retention window. Returns how many files were removed; anything
/// unreadable or unrecognized is left alone.
fn prune_rotated_logs(logs_dir: &Path, retention_days: u64) -> usize {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return 0;
    };
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| matches!(rotation_date(path), Some(stamp) if stamp < cutoff))
        .filter(|path| fs::remove_file(path).is_ok())
        .count()
}

/// The date stamp of a rotated log file, `None` for anything that is not
/// one of ours.
fn rotation_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let stamp = name.strip_prefix(LOG_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}
