// =============================================================================
// Canonical Rules Schema — strict, pattern-discriminated rule records
// =============================================================================
//
// The schema is the only boundary between rule authoring and execution.
// Records arrive as camelCase JSON from the authoring surface, discriminated
// by the `pattern` tag. Validation rejects anything missing a required field,
// out of the enumerated range, or not matching the discriminator; nothing
// partial or untagged is ever propagated downstream.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::instruments::Instrument;

// ---------------------------------------------------------------------------
// Shared sub-records
// ---------------------------------------------------------------------------

/// Contract maths for the traded instrument. The tick fields are carried in
/// the record (not looked up) so a stored strategy stays self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentSpec {
    pub symbol: Instrument,
    pub contract_size: f64,
    pub tick_size: f64,
    pub tick_value: f64,
}

impl InstrumentSpec {
    /// Build a spec from the built-in contract table.
    pub fn standard(symbol: Instrument) -> Self {
        Self {
            symbol,
            contract_size: 1.0,
            tick_size: symbol.tick_size(),
            tick_value: symbol.tick_value(),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.contract_size <= 0.0 {
            return Err(ValidationError("instrument.contractSize must be > 0".into()));
        }
        if self.tick_size <= 0.0 {
            return Err(ValidationError("instrument.tickSize must be > 0".into()));
        }
        if self.tick_value <= 0.0 {
            return Err(ValidationError("instrument.tickValue must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossKind {
    FixedTicks,
    Structure,
    AtrMultiple,
    OppositeRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLossRule {
    #[serde(rename = "type")]
    pub kind: StopLossKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfitKind {
    RrRatio,
    FixedTicks,
    OppositeRange,
    Structure,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitRule {
    #[serde(rename = "type")]
    pub kind: TakeProfitKind,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRules {
    pub stop_loss: StopLossRule,
    pub take_profit: TakeProfitRule,
}

impl ExitRules {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.stop_loss.value < 0.0 {
            return Err(ValidationError("exit.stopLoss.value must be >= 0".into()));
        }
        if self.take_profit.value <= 0.0 {
            return Err(ValidationError("exit.takeProfit.value must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    RiskPercent,
    FixedContracts,
}

/// Risk parameters. `risk_percent` is in percent units (1.0 == 1 %), never a
/// fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRules {
    pub position_sizing: PositionSizing,
    pub risk_percent: f64,
    pub max_contracts: u32,
}

impl RiskRules {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(0.1..=5.0).contains(&self.risk_percent) {
            return Err(ValidationError(format!(
                "risk.riskPercent must be in [0.1, 5], got {}",
                self.risk_percent
            )));
        }
        if !(1..=20).contains(&self.max_contracts) {
            return Err(ValidationError(format!(
                "risk.maxContracts must be in [1, 20], got {}",
                self.max_contracts
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    Ny,
    London,
    Asia,
    All,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRules {
    pub session: Session,
    #[serde(default)]
    pub custom_start: Option<String>,
    #[serde(default)]
    pub custom_end: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

impl TimeRules {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.session == Session::Custom {
            let start = self
                .custom_start
                .as_deref()
                .ok_or_else(|| ValidationError("time.customStart required for custom session".into()))?;
            let end = self
                .custom_end
                .as_deref()
                .ok_or_else(|| ValidationError("time.customEnd required for custom session".into()))?;
            parse_hhmm(start)?;
            parse_hhmm(end)?;
        }
        Ok(())
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Result<u32, ValidationError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| ValidationError(format!("expected HH:MM, got '{s}'")))?;
    let hours: u32 = h
        .parse()
        .map_err(|_| ValidationError(format!("invalid hour in '{s}'")))?;
    let minutes: u32 = m
        .parse()
        .map_err(|_| ValidationError(format!("invalid minute in '{s}'")))?;
    if hours > 23 || minutes > 59 {
        return Err(ValidationError(format!("time '{s}' out of range")));
    }
    Ok(hours * 60 + minutes)
}

/// Which side(s) a strategy is allowed to trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    Long,
    Short,
    Both,
}

impl Default for DirectionFilter {
    fn default() -> Self {
        Self::Both
    }
}

impl DirectionFilter {
    pub fn allows_long(&self) -> bool {
        matches!(self, Self::Long | Self::Both)
    }

    pub fn allows_short(&self) -> bool {
        matches!(self, Self::Short | Self::Both)
    }
}

// ---------------------------------------------------------------------------
// Pattern-specific entry records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrbEntryOn {
    BreakHigh,
    BreakLow,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrbEntry {
    pub period_minutes: u32,
    pub entry_on: OrbEntryOn,
}

impl OrbEntry {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(5..=120).contains(&self.period_minutes) {
            return Err(ValidationError(format!(
                "entry.periodMinutes must be in [5, 120], got {}",
                self.period_minutes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullbackConfirmation {
    Touch,
    CloseAbove,
    Bounce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsiFilter {
    pub period: u32,
    pub threshold: f64,
    pub direction: RsiDirection,
}

impl RsiFilter {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(2..=50).contains(&self.period) {
            return Err(ValidationError(format!(
                "entry.indicators.rsi.period must be in [2, 50], got {}",
                self.period
            )));
        }
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(ValidationError(format!(
                "entry.indicators.rsi.threshold must be in [0, 100], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmaPullbackEntry {
    pub ema_period: u32,
    pub pullback_confirmation: PullbackConfirmation,
    #[serde(default)]
    pub rsi: Option<RsiFilter>,
}

impl EmaPullbackEntry {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(5..=200).contains(&self.ema_period) {
            return Err(ValidationError(format!(
                "entry.emaPeriod must be in [5, 200], got {}",
                self.ema_period
            )));
        }
        if let Some(rsi) = &self.rsi {
            rsi.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakoutLevelType {
    Resistance,
    Support,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakoutConfirmation {
    Close,
    Volume,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakoutEntry {
    #[serde(default = "default_lookback")]
    pub lookback_period: u32,
    pub level_type: BreakoutLevelType,
    pub confirmation: BreakoutConfirmation,
}

fn default_lookback() -> u32 {
    20
}

impl BreakoutEntry {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(5..=100).contains(&self.lookback_period) {
            return Err(ValidationError(format!(
                "entry.lookbackPeriod must be in [5, 100], got {}",
                self.lookback_period
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tagged rule record
// ---------------------------------------------------------------------------

/// The canonical, validated rule record. A tagged sum over the three trading
/// patterns; each variant carries the same four sub-records plus its
/// pattern-specific entry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum CanonicalRules {
    #[serde(rename_all = "camelCase")]
    OpeningRangeBreakout {
        instrument: InstrumentSpec,
        #[serde(default)]
        direction: DirectionFilter,
        entry: OrbEntry,
        exit: ExitRules,
        risk: RiskRules,
        time: TimeRules,
    },
    #[serde(rename_all = "camelCase")]
    EmaPullback {
        instrument: InstrumentSpec,
        #[serde(default)]
        direction: DirectionFilter,
        entry: EmaPullbackEntry,
        exit: ExitRules,
        risk: RiskRules,
        time: TimeRules,
    },
    #[serde(rename_all = "camelCase")]
    Breakout {
        instrument: InstrumentSpec,
        #[serde(default)]
        direction: DirectionFilter,
        entry: BreakoutEntry,
        exit: ExitRules,
        risk: RiskRules,
        time: TimeRules,
    },
}

impl CanonicalRules {
    /// Strict validation of every field range. Any record that passes is
    /// safe to compile; downstream code never re-interprets text fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.instrument().validate()?;
        self.exit().validate()?;
        self.risk().validate()?;
        self.time().validate()?;
        match self {
            Self::OpeningRangeBreakout { entry, .. } => entry.validate(),
            Self::EmaPullback { entry, .. } => entry.validate(),
            Self::Breakout { entry, .. } => entry.validate(),
        }
    }

    /// Parse and validate a canonical JSON record in one step.
    pub fn parse(json: &serde_json::Value) -> Result<Self, ValidationError> {
        let rules: Self = serde_json::from_value(json.clone())
            .map_err(|e| ValidationError(format!("malformed canonical rules: {e}")))?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn pattern_name(&self) -> &'static str {
        match self {
            Self::OpeningRangeBreakout { .. } => "opening_range_breakout",
            Self::EmaPullback { .. } => "ema_pullback",
            Self::Breakout { .. } => "breakout",
        }
    }

    pub fn instrument(&self) -> &InstrumentSpec {
        match self {
            Self::OpeningRangeBreakout { instrument, .. }
            | Self::EmaPullback { instrument, .. }
            | Self::Breakout { instrument, .. } => instrument,
        }
    }

    pub fn direction(&self) -> DirectionFilter {
        match self {
            Self::OpeningRangeBreakout { direction, .. }
            | Self::EmaPullback { direction, .. }
            | Self::Breakout { direction, .. } => *direction,
        }
    }

    pub fn exit(&self) -> &ExitRules {
        match self {
            Self::OpeningRangeBreakout { exit, .. }
            | Self::EmaPullback { exit, .. }
            | Self::Breakout { exit, .. } => exit,
        }
    }

    pub fn risk(&self) -> &RiskRules {
        match self {
            Self::OpeningRangeBreakout { risk, .. }
            | Self::EmaPullback { risk, .. }
            | Self::Breakout { risk, .. } => risk,
        }
    }

    pub fn time(&self) -> &TimeRules {
        match self {
            Self::OpeningRangeBreakout { time, .. }
            | Self::EmaPullback { time, .. }
            | Self::Breakout { time, .. } => time,
        }
    }
}
