// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::schema::CanonicalRules;

// ---------------------------------------------------------------------------
// Market data entities
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Time buckets are aligned on 5-minute boundaries
/// rounded down from the tick timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest top-of-book quote for a subscribed symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// High/low of the first N minutes of a session.
///
/// Completion is monotonic: once `is_complete` is true the range is immutable
/// and may be cached or persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_complete: bool,
}

// ---------------------------------------------------------------------------
// Direction / account enums
// ---------------------------------------------------------------------------

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// `+1.0` for long, `-1.0` for short. Used in signed PnL math.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Whether the engine runs against the live or demo broker environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Demo,
    Live,
}

impl Default for AccountType {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Per-strategy autonomy: copilot requires external approval of every setup,
/// autopilot executes automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Copilot,
    Autopilot,
}

impl Default for AutonomyLevel {
    fn default() -> Self {
        Self::Copilot
    }
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copilot => write!(f, "copilot"),
            Self::Autopilot => write!(f, "autopilot"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order / fill entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
            Self::Stop => write!(f, "Stop"),
            Self::StopLimit => write!(f, "StopLimit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Day
    }
}

/// Order lifecycle status.
///
/// `Pending -> Working -> (PartialFill) -> Filled | Cancelled | Rejected |
/// Expired`. The last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Working,
    PartialFill,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Working => "Working",
            Self::PartialFill => "PartialFill",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        };
        write!(f, "{s}")
    }
}

/// Role of an order within a bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketType {
    Entry,
    StopLoss,
    TakeProfit,
}

/// A tracked order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: String,
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub broker_account_id: String,
    /// Engine-side idempotency key; at most one order row per setup id.
    pub setup_id: Option<String>,
    pub broker_order_id: Option<String>,

    // Order fields
    pub symbol: String,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub order_qty: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,

    // Fill fields
    pub filled_qty: u32,
    pub avg_fill_price: Option<f64>,

    // Lifecycle
    pub status: OrderStatus,
    pub reject_reason: Option<String>,

    // Bracket linkage
    pub parent_order_id: Option<String>,
    pub bracket_type: Option<BracketType>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Submit -> broker-ack latency, recorded on submission.
    pub submit_latency_ms: Option<u64>,
}

/// One execution report from the broker. `broker_fill_id` is the idempotency
/// key: recording the same fill twice is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub broker_fill_id: Option<String>,
    pub qty: u32,
    pub price: f64,
    pub commission: f64,
    pub fill_timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Position entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    Emergency,
    Eod,
}

/// A managed position built from fills.
///
/// PnL fields are in price points multiplied by quantity; dollar conversion
/// via the instrument point value is the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub net_qty: u32,
    pub avg_entry_price: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_order_id: Option<String>,
    pub target_order_id: Option<String>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Strategy configuration
// ---------------------------------------------------------------------------

/// A strategy as loaded from persistence at engine start. The rules have
/// already passed strict schema validation before the row was stored; the
/// engine re-validates on load and refuses to compile anything invalid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub user_id: String,
    pub broker_account_id: String,
    pub name: String,
    pub rules: CanonicalRules,
    #[serde(default)]
    pub autonomy_level: AutonomyLevel,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Daily loss cap in dollars; breaching it auto-pauses the strategy.
    pub max_daily_loss: Option<f64>,
    #[serde(default = "default_true")]
    pub alerts_enabled: bool,
}

fn default_true() -> bool {
    true
}
