use serde::{Deserialize, Serialize};

/// Narrow error dialect every adapter translates transport errors into.
/// Upstream layers never inspect vendor-specific errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, 5xx, unknown.
    Transient,
    /// Deadline exceeded.
    Timeout,
    /// Adapter signalled throttling (429 or equivalent).
    RateLimit,
    /// Adapter signalled maintenance/outage.
    ServiceUnavailable,
    /// Authentication/authorization failure.
    Auth,
    /// Malformed params or failed preconditions.
    Validation,
    /// Target resource missing.
    NotFound,
    /// Other 4xx class.
    Client,
    /// Rejected by the circuit breaker, not by the adapter.
    BreakerOpen,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Client => "client",
            ErrorKind::BreakerOpen => "breaker_open",
        }
    }

    /// Whether the retry engine may schedule another attempt for this kind.
    /// A breaker rejection is final for the attempt; the fallback dispatcher
    /// decides what happens next.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ServiceUnavailable
        )
    }

    /// Whether a failure of this kind is a symptom of remote unavailability
    /// and therefore feeds the circuit breaker's failure window.
    pub fn counts_toward_breaker(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::ServiceUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_set_matches_taxonomy() {
        assert!(ErrorKind::Transient.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::RateLimit.is_retriable());
        assert!(ErrorKind::ServiceUnavailable.is_retriable());
        assert!(!ErrorKind::Auth.is_retriable());
        assert!(!ErrorKind::Validation.is_retriable());
        assert!(!ErrorKind::NotFound.is_retriable());
        assert!(!ErrorKind::Client.is_retriable());
        assert!(!ErrorKind::BreakerOpen.is_retriable());
    }

    #[test]
    fn breaker_window_ignores_client_and_throttle_kinds() {
        assert!(ErrorKind::Transient.counts_toward_breaker());
        assert!(ErrorKind::ServiceUnavailable.counts_toward_breaker());
        assert!(!ErrorKind::RateLimit.counts_toward_breaker());
        assert!(!ErrorKind::Auth.counts_toward_breaker());
        assert!(!ErrorKind::Client.counts_toward_breaker());
        assert!(!ErrorKind::BreakerOpen.counts_toward_breaker());
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::RateLimit).unwrap(),
            "\"rate_limit\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::BreakerOpen).unwrap(),
            "\"breaker_open\""
        );
    }
}
