// =============================================================================
// Error taxonomy for the Meridian engine
// =============================================================================
//
// Propagation policy:
//   - Market-data transients are recovered locally (reconnect + breaker).
//   - Order failures surface to the queue dispatcher, mark the setup failed,
//     and never halt the engine.
//   - Safety-limit blocks are reported to the caller and alerted.
//   - Only unrecoverable init failures move the engine to the error state.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::safety::Violation;

/// What the caller should do after an order execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Alert,
    EmergencyStop,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Alert => write!(f, "alert"),
            Self::EmergencyStop => write!(f, "emergency_stop"),
        }
    }
}

/// Rules that fail strict schema validation never reach the compiler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rule validation failed: {0}")]
pub struct ValidationError(pub String);

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Raised by the broker client. `retryable` iff the HTTP status is >= 500.
    #[error("broker API error {code} (http status {http_status:?}): {message}")]
    BrokerApi {
        code: String,
        http_status: Option<u16>,
        retryable: bool,
        message: String,
    },

    /// Raised by a circuit breaker while OPEN and the timeout has not elapsed.
    #[error("circuit breaker '{breaker}' is open; next retry in {retry_in:?}")]
    CircuitOpen { breaker: String, retry_in: Duration },

    /// Raised when order submission fails; the order row is marked Rejected.
    #[error("order execution failed ({recovery}): {message}")]
    OrderExecution {
        order_id: Option<String>,
        recovery: RecoveryAction,
        message: String,
    },

    /// Raised when a pre-trade safety check finds a blocked violation.
    #[error("safety limit violated: {violation}")]
    SafetyLimit { violation: Violation },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Construct a broker API error, deriving retryability from the status.
    pub fn broker(code: impl Into<String>, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self::BrokerApi {
            code: code.into(),
            http_status,
            retryable: http_status.map_or(false, |s| s >= 500),
            message: message.into(),
        }
    }

    /// Whether the operation may be retried immediately.
    pub fn retryable(&self) -> bool {
        match self {
            Self::BrokerApi { retryable, .. } => *retryable,
            // An open breaker is non-retryable for the duration of its window.
            Self::CircuitOpen { .. } => false,
            Self::OrderExecution { recovery, .. } => *recovery == RecoveryAction::Retry,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_retryable_only_on_5xx() {
        assert!(EngineError::broker("Timeout", Some(503), "upstream").retryable());
        assert!(!EngineError::broker("BadRequest", Some(400), "rejected").retryable());
        assert!(!EngineError::broker("NoStatus", None, "socket closed").retryable());
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        let err = EngineError::CircuitOpen {
            breaker: "broker:orders".into(),
            retry_in: Duration::from_secs(30),
        };
        assert!(!err.retryable());
        assert!(err.to_string().contains("broker:orders"));
    }

    #[test]
    fn order_execution_retryable_follows_recovery_action() {
        let retry = EngineError::OrderExecution {
            order_id: Some("o-1".into()),
            recovery: RecoveryAction::Retry,
            message: "gateway timeout".into(),
        };
        let skip = EngineError::OrderExecution {
            order_id: None,
            recovery: RecoveryAction::Skip,
            message: "rejected".into(),
        };
        assert!(retry.retryable());
        assert!(!skip.retryable());
    }
}
