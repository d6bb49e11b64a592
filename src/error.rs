// =============================================================================
// Engine error taxonomy (§7)
// =============================================================================
//
// Components that callers must branch on (retry vs. surface vs. veto) return
// `EngineError`; glue code (startup, config, persistence) uses `anyhow`
// instead, exactly as the teacher splits the two in `runtime_config.rs`
// versus `execution.rs`'s `ExecutionResult` enum.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    AuthExpired,
    Transient(String),
    RateLimited,
    InvalidInput(String),
    InvalidPrice(String),
    NoContract(String),
    RiskVeto(String),
    BrokerRejected(String),
    StateConflict(String),
    Timeout,
    Cancelled,
    Internal(String),
}

impl EngineError {
    /// Machine-readable code for the REST error envelope (§6).
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthExpired => "AuthExpired",
            Self::Transient(_) => "Transient",
            Self::RateLimited => "RateLimited",
            Self::InvalidInput(_) => "InvalidInput",
            Self::InvalidPrice(_) => "InvalidPrice",
            Self::NoContract(_) => "NoContract",
            Self::RiskVeto(_) => "RiskVeto",
            Self::BrokerRejected(_) => "BrokerRejected",
            Self::StateConflict(_) => "StateConflict",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status mapping for the control surface (§6).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthExpired => 401,
            Self::RiskVeto(_) => 403,
            Self::NoContract(_) => 404,
            Self::StateConflict(_) => 409,
            Self::RateLimited => 429,
            Self::InvalidInput(_) | Self::InvalidPrice(_) => 400,
            Self::Transient(_) | Self::Timeout | Self::Internal(_) | Self::BrokerRejected(_) => 500,
            Self::Cancelled => 499,
        }
    }

    /// Only `Transient`/`Timeout` failures are eligible for automatic retry
    /// (§4.C, §4.K, §7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }

    /// Whether a failed action should additionally raise a user-visible
    /// notification (§7: `Cancelled` is silent, everything terminal is not).
    pub fn notifies(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::AuthExpired)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthExpired => write!(f, "session token expired"),
            Self::Transient(msg) => write!(f, "transient error: {msg}"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::InvalidPrice(msg) => write!(f, "invalid price: {msg}"),
            Self::NoContract(symbol) => write!(f, "no contract for symbol: {symbol}"),
            Self::RiskVeto(reason) => write!(f, "risk veto: {reason}"),
            Self::BrokerRejected(reason) => write!(f, "broker rejected: {reason}"),
            Self::StateConflict(msg) => write!(f, "state conflict: {msg}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_timeout_retry() {
        assert!(EngineError::Transient("boom".into()).is_retryable());
        assert!(EngineError::Timeout.is_retryable());
        assert!(!EngineError::RiskVeto("dll".into()).is_retryable());
        assert!(!EngineError::RateLimited.is_retryable());
    }

    #[test]
    fn cancelled_is_silent() {
        assert!(!EngineError::Cancelled.notifies());
        assert!(EngineError::Internal("x".into()).notifies());
    }

    #[test]
    fn http_status_mapping_matches_spec_table() {
        assert_eq!(EngineError::InvalidPrice("x".into()).http_status(), 400);
        assert_eq!(EngineError::AuthExpired.http_status(), 401);
        assert_eq!(EngineError::RiskVeto("x".into()).http_status(), 403);
        assert_eq!(EngineError::NoContract("x".into()).http_status(), 404);
        assert_eq!(EngineError::StateConflict("x".into()).http_status(), 409);
        assert_eq!(EngineError::RateLimited.http_status(), 429);
    }
}
