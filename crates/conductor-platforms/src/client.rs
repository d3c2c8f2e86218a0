use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use conductor_types::{ActionType, ErrorKind, Platform};

/// Successful adapter response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlatformResponse {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl PlatformResponse {
    pub fn with_external_id(external_id: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            external_id: Some(external_id.into()),
        }
    }
}

/// Failed adapter response, already translated into the shared taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::RateLimit
    }

    pub fn is_auth(&self) -> bool {
        self.kind == ErrorKind::Auth
    }
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PlatformError {}

/// Uniform adapter surface for every external platform.
///
/// Adapters translate transport errors into [`ErrorKind`] so upstream layers
/// never see vendor dialects, and they never retry on their own — retry,
/// breaker, and fallback live in the executor pipeline.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// Field names that must never leave the process in event payloads or
    /// journal records.
    fn redaction_masks(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        action_type: ActionType,
        params: &Value,
        deadline: Instant,
    ) -> Result<PlatformResponse, PlatformError>;

    async fn health_check(&self) -> Result<(), PlatformError>;

    /// Reverse an earlier effect. Used by workflow rollback; optional.
    async fn compensate(
        &self,
        action_type: ActionType,
        external_id: &str,
        params: &Value,
    ) -> Result<PlatformResponse, PlatformError> {
        let _ = (action_type, external_id, params);
        Err(PlatformError::new(
            ErrorKind::Validation,
            format!("{} adapter does not support compensation", self.platform()),
        ))
    }
}

/// Map a raw vendor error string into the shared taxonomy. Adapters that
/// lack structured status codes fall back to this.
pub fn classify_error_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return ErrorKind::RateLimit;
    }
    if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
    {
        return ErrorKind::Auth;
    }
    if lower.contains("not found") || lower.contains("404") {
        return ErrorKind::NotFound;
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return ErrorKind::Timeout;
    }
    if lower.contains("unavailable") || lower.contains("maintenance") || lower.contains("503") {
        return ErrorKind::ServiceUnavailable;
    }
    if lower.contains("invalid") || lower.contains("validation") || lower.contains("400") {
        return ErrorKind::Validation;
    }
    if lower.contains("409") || lower.contains("conflict") || lower.contains("422") {
        return ErrorKind::Client;
    }
    ErrorKind::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_vendor_strings() {
        assert_eq!(classify_error_text("HTTP 429 Too Many Requests"), ErrorKind::RateLimit);
        assert_eq!(classify_error_text("401 Unauthorized"), ErrorKind::Auth);
        assert_eq!(classify_error_text("page not found"), ErrorKind::NotFound);
        assert_eq!(classify_error_text("request timed out"), ErrorKind::Timeout);
        assert_eq!(classify_error_text("503 service unavailable"), ErrorKind::ServiceUnavailable);
        assert_eq!(classify_error_text("invalid property id"), ErrorKind::Validation);
        assert_eq!(classify_error_text("connection reset by peer"), ErrorKind::Transient);
    }

    #[test]
    fn platform_error_flags_follow_kind() {
        let err = PlatformError::new(ErrorKind::RateLimit, "throttled");
        assert!(err.is_retriable());
        assert!(err.is_rate_limit());
        assert!(!err.is_auth());
    }
}
