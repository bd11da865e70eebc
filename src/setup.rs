// =============================================================================
// Setup Detection — concrete entry candidates flowing through the queue
// =============================================================================
//
// The setup id is the idempotency key from enqueue all the way to the broker
// (customTag50) and the persisted order (setupId). Format, bit-exact:
//
//   "{strategyId}-{iso8601Timestamp}-{direction}-{6-hex-nonce}"
//
// Consumers may split on `-` from the right; the nonce is the only source of
// sub-millisecond uniqueness.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Direction;

/// Lifecycle of a setup in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Rejected,
    Alerted,
    Executed,
    Failed,
}

impl std::fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Alerted => "alerted",
            Self::Executed => "executed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Entry,
    Exit,
}

/// A fully described, actionable setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupDetection {
    pub id: String,
    pub strategy_id: String,
    pub instrument: String,
    pub signal_type: SignalType,
    pub direction: Direction,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub conditions_met: Vec<String>,
    pub indicators: BTreeMap<String, Option<f64>>,
    pub status: SetupStatus,
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub contract_quantity: Option<u32>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
}

/// Build a deterministic setup id for (strategy, time, direction) plus a
/// random 6-hex nonce.
pub fn setup_id(strategy_id: &str, timestamp: DateTime<Utc>, direction: Direction) -> String {
    let iso = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let nonce = &Uuid::new_v4().simple().to_string()[..6];
    format!("{strategy_id}-{iso}-{direction}-{nonce}")
}
