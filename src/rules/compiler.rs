// =============================================================================
// Rule Compiler — canonical rules to executable strategy operations
// =============================================================================
//
// Compilation is total over a validated canonical record: it never fails.
// Every operation is pure with respect to the supplied EvaluationContext, so
// the engine can evaluate strategies concurrently without coordination.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rules::schema::{
    BreakoutConfirmation, BreakoutLevelType, CanonicalRules, OrbEntryOn, PositionSizing,
    PullbackConfirmation, RsiDirection, StopLossKind, TakeProfitKind,
};
use crate::rules::session::{minute_of_day, session_window, SessionWindow};
use crate::types::{Direction, Ohlcv, OpeningRange, Quote};

/// Stop fallback distance (in ticks) when a structural reference is missing.
const FALLBACK_STOP_TICKS: f64 = 20.0;
/// ATR fallback (in ticks) when `atr14` is not yet available.
const FALLBACK_ATR_TICKS: f64 = 10.0;
/// Candles scanned for structural swing stops.
const STRUCTURE_LOOKBACK: usize = 10;
/// Candles scanned for the EMA pullback gate.
const PULLBACK_LOOKBACK: usize = 5;
/// Candles averaged for volume confirmation.
const VOLUME_LOOKBACK: usize = 20;

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Indicator values computed by the market-data aggregator for one symbol.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSnapshot {
    emas: HashMap<u32, f64>,
    rsis: HashMap<u32, f64>,
    pub atr14: Option<f64>,
    pub vwap: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn set_ema(&mut self, period: u32, value: f64) {
        self.emas.insert(period, value);
    }

    pub fn set_rsi(&mut self, period: u32, value: f64) {
        self.rsis.insert(period, value);
    }

    pub fn ema(&self, period: u32) -> Option<f64> {
        self.emas.get(&period).copied()
    }

    pub fn rsi(&self, period: u32) -> Option<f64> {
        self.rsis.get(&period).copied()
    }

    /// Flatten into the string-keyed map carried on a setup detection.
    pub fn to_map(&self) -> BTreeMap<String, Option<f64>> {
        let mut map = BTreeMap::new();
        for (period, value) in &self.emas {
            map.insert(format!("ema{period}"), Some(*value));
        }
        for (period, value) in &self.rsis {
            map.insert(format!("rsi{period}"), Some(*value));
        }
        map.insert("atr14".to_string(), self.atr14);
        map.insert("vwap".to_string(), self.vwap);
        map
    }
}

/// Everything an entry evaluation may look at. Candles are closed candles,
/// oldest first; the in-progress candle is never part of the slice.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub candles: &'a [Ohlcv],
    pub quote: &'a Quote,
    pub indicators: &'a IndicatorSnapshot,
    pub opening_range: Option<&'a OpeningRange>,
    pub current_time: DateTime<Utc>,
}

/// A concrete entry candidate emitted by `should_enter`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySignal {
    pub direction: Direction,
    pub reason: String,
    pub confidence: f64,
    pub trigger_price: f64,
}

// ---------------------------------------------------------------------------
// Compiled strategy
// ---------------------------------------------------------------------------

/// A validated rule record compiled into executable entry/exit/sizing/time
/// operations.
#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    rules: CanonicalRules,
}

impl CompiledStrategy {
    /// Compile a validated canonical record. Total: never fails.
    pub fn compile(rules: CanonicalRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &CanonicalRules {
        &self.rules
    }

    pub fn pattern(&self) -> &'static str {
        self.rules.pattern_name()
    }

    fn tick_size(&self) -> f64 {
        self.rules.instrument().tick_size
    }

    fn window(&self) -> SessionWindow {
        // Time rules were validated with the record; resolution cannot fail
        // for a validated record, but fall back to always-open if it does.
        session_window(self.rules.time()).unwrap_or(SessionWindow { start: 0, end: 1440 })
    }

    /// Whether the engine should fetch an opening range for this strategy.
    pub fn needs_opening_range(&self) -> bool {
        matches!(self.rules, CanonicalRules::OpeningRangeBreakout { .. })
            || self.rules.exit().stop_loss.kind == StopLossKind::OppositeRange
            || self.rules.exit().take_profit.kind == TakeProfitKind::OppositeRange
    }

    /// Opening-range window in minutes-of-day `(start, end)`, if the pattern
    /// defines one.
    pub fn opening_range_window(&self) -> Option<(u32, u32)> {
        match &self.rules {
            CanonicalRules::OpeningRangeBreakout { entry, .. } => {
                let start = self.window().start;
                Some((start, start + entry.period_minutes))
            }
            _ => None,
        }
    }

    /// EMA period the engine must compute beyond the standard 20/50/200 set.
    pub fn ema_period(&self) -> Option<u32> {
        match &self.rules {
            CanonicalRules::EmaPullback { entry, .. } => Some(entry.ema_period),
            _ => None,
        }
    }

    /// RSI period of the configured filter, if any.
    pub fn rsi_period(&self) -> Option<u32> {
        match &self.rules {
            CanonicalRules::EmaPullback { entry, .. } => entry.rsi.as_ref().map(|r| r.period),
            _ => None,
        }
    }

    /// Whether `now` lies inside the strategy's session, wrap-aware.
    pub fn is_time_valid(&self, now: DateTime<Utc>) -> bool {
        self.window()
            .contains(minute_of_day(now, self.rules.time()))
    }

    /// Default entry price: the last traded price.
    pub fn entry_price(&self, ctx: &EvaluationContext<'_>) -> f64 {
        ctx.quote.last
    }

    // -------------------------------------------------------------------------
    // Entry evaluation
    // -------------------------------------------------------------------------

    /// Evaluate the pattern entry conditions. Returns `None` when no entry is
    /// warranted.
    pub fn should_enter(&self, ctx: &EvaluationContext<'_>) -> Option<EntrySignal> {
        if !self.is_time_valid(ctx.current_time) {
            return None;
        }

        match &self.rules {
            CanonicalRules::OpeningRangeBreakout { entry, direction, .. } => {
                self.evaluate_orb(ctx, entry.period_minutes, entry.entry_on, *direction)
            }
            CanonicalRules::EmaPullback { entry, direction, .. } => {
                self.evaluate_ema_pullback(ctx, entry, *direction)
            }
            CanonicalRules::Breakout { entry, direction, .. } => {
                self.evaluate_breakout(ctx, entry, *direction)
            }
        }
    }

    fn evaluate_orb(
        &self,
        ctx: &EvaluationContext<'_>,
        period_minutes: u32,
        entry_on: OrbEntryOn,
        direction: crate::rules::schema::DirectionFilter,
    ) -> Option<EntrySignal> {
        let or = ctx.opening_range?;
        if !or.is_complete {
            return None;
        }

        // The range must have had time to form: no entries before
        // sessionStart + periodMinutes even if price has already crossed.
        let window = self.window();
        let minute = minute_of_day(ctx.current_time, self.rules.time());
        if window.minutes_since_open(minute) < period_minutes {
            return None;
        }

        let prev = prev_candle(ctx.candles)?;

        let wants_high = matches!(entry_on, OrbEntryOn::BreakHigh | OrbEntryOn::Both);
        let wants_low = matches!(entry_on, OrbEntryOn::BreakLow | OrbEntryOn::Both);

        if direction.allows_long() && wants_high && prev.close <= or.high && ctx.quote.last > or.high
        {
            return Some(EntrySignal {
                direction: Direction::Long,
                reason: format!(
                    "price {:.2} broke above opening range high {:.2}",
                    ctx.quote.last, or.high
                ),
                confidence: 0.85,
                trigger_price: or.high,
            });
        }

        if direction.allows_short() && wants_low && prev.close >= or.low && ctx.quote.last < or.low
        {
            return Some(EntrySignal {
                direction: Direction::Short,
                reason: format!(
                    "price {:.2} broke below opening range low {:.2}",
                    ctx.quote.last, or.low
                ),
                confidence: 0.85,
                trigger_price: or.low,
            });
        }

        None
    }

    fn evaluate_ema_pullback(
        &self,
        ctx: &EvaluationContext<'_>,
        entry: &crate::rules::schema::EmaPullbackEntry,
        direction: crate::rules::schema::DirectionFilter,
    ) -> Option<EntrySignal> {
        if ctx.candles.len() < PULLBACK_LOOKBACK {
            return None;
        }
        let ema = ctx.indicators.ema(entry.ema_period)?;
        let current = ctx.candles.last()?;
        let prev = prev_candle(ctx.candles)?;

        let bullish = ctx.quote.last > ema && prev.close > ema;
        let bearish = ctx.quote.last < ema && prev.close < ema;

        let side = if bullish && direction.allows_long() {
            Direction::Long
        } else if bearish && direction.allows_short() {
            Direction::Short
        } else {
            return None;
        };

        // Pullback gate: price must have touched the EMA recently.
        let touched = ctx.candles[ctx.candles.len() - PULLBACK_LOOKBACK..]
            .iter()
            .any(|c| c.low <= ema && ema <= c.high);
        if !touched {
            return None;
        }

        // Optional RSI filter.
        if let Some(filter) = &entry.rsi {
            let rsi = ctx.indicators.rsi(filter.period)?;
            let holds = match filter.direction {
                RsiDirection::Above => rsi > filter.threshold,
                RsiDirection::Below => rsi < filter.threshold,
            };
            if !holds {
                return None;
            }
        }

        // Confirmation gate.
        let close_above = match side {
            Direction::Long => prev.low <= ema && current.close > ema,
            Direction::Short => prev.high >= ema && current.close < ema,
        };
        let confirmed = match entry.pullback_confirmation {
            PullbackConfirmation::Touch => true,
            PullbackConfirmation::CloseAbove => close_above,
            PullbackConfirmation::Bounce => {
                close_above
                    && match side {
                        Direction::Long => current.close > prev.close,
                        Direction::Short => current.close < prev.close,
                    }
            }
        };
        if !confirmed {
            return None;
        }

        Some(EntrySignal {
            direction: side,
            reason: format!(
                "{side} pullback to EMA{} at {ema:.2} confirmed",
                entry.ema_period
            ),
            confidence: 0.75,
            trigger_price: ema,
        })
    }

    fn evaluate_breakout(
        &self,
        ctx: &EvaluationContext<'_>,
        entry: &crate::rules::schema::BreakoutEntry,
        direction: crate::rules::schema::DirectionFilter,
    ) -> Option<EntrySignal> {
        let lookback = entry.lookback_period as usize;
        if ctx.candles.len() < lookback {
            return None;
        }
        let window = &ctx.candles[ctx.candles.len() - lookback..];
        let period_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let period_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        let current = ctx.candles.last()?;
        let prev = prev_candle(ctx.candles)?;

        let volume_confirmed = || {
            let tail = &ctx.candles[ctx.candles.len().saturating_sub(VOLUME_LOOKBACK)..];
            if tail.is_empty() {
                return false;
            }
            let mean = tail.iter().map(|c| c.volume).sum::<f64>() / tail.len() as f64;
            current.volume > 1.5 * mean
        };

        let wants_resistance =
            matches!(entry.level_type, BreakoutLevelType::Resistance | BreakoutLevelType::Both);
        let wants_support =
            matches!(entry.level_type, BreakoutLevelType::Support | BreakoutLevelType::Both);

        if direction.allows_long()
            && wants_resistance
            && prev.high < period_high
            && ctx.quote.last > period_high
        {
            let confirmed = match entry.confirmation {
                BreakoutConfirmation::None => true,
                BreakoutConfirmation::Close => current.close > period_high,
                BreakoutConfirmation::Volume => volume_confirmed(),
            };
            if confirmed {
                return Some(EntrySignal {
                    direction: Direction::Long,
                    reason: format!(
                        "price {:.2} broke {}-bar resistance {:.2}",
                        ctx.quote.last, entry.lookback_period, period_high
                    ),
                    confidence: 0.70,
                    trigger_price: period_high,
                });
            }
        }

        if direction.allows_short()
            && wants_support
            && prev.low > period_low
            && ctx.quote.last < period_low
        {
            let confirmed = match entry.confirmation {
                BreakoutConfirmation::None => true,
                BreakoutConfirmation::Close => current.close < period_low,
                BreakoutConfirmation::Volume => volume_confirmed(),
            };
            if confirmed {
                return Some(EntrySignal {
                    direction: Direction::Short,
                    reason: format!(
                        "price {:.2} broke {}-bar support {:.2}",
                        ctx.quote.last, entry.lookback_period, period_low
                    ),
                    confidence: 0.70,
                    trigger_price: period_low,
                });
            }
        }

        None
    }

    // -------------------------------------------------------------------------
    // Exit levels
    // -------------------------------------------------------------------------

    /// Protective stop for an entry at `entry` in `direction`.
    pub fn stop_price(
        &self,
        direction: Direction,
        entry: f64,
        ctx: &EvaluationContext<'_>,
    ) -> f64 {
        let tick = self.tick_size();
        let rule = &self.rules.exit().stop_loss;
        let sign = direction.sign();

        match rule.kind {
            StopLossKind::FixedTicks => entry - sign * rule.value * tick,
            StopLossKind::AtrMultiple => {
                let atr = ctx.indicators.atr14.unwrap_or(FALLBACK_ATR_TICKS * tick);
                entry - sign * rule.value * atr
            }
            StopLossKind::Structure => {
                let tail =
                    &ctx.candles[ctx.candles.len().saturating_sub(STRUCTURE_LOOKBACK)..];
                match direction {
                    Direction::Long => tail
                        .iter()
                        .map(|c| c.low)
                        .fold(f64::MAX, f64::min)
                        .min(entry)
                        - tick,
                    Direction::Short => tail
                        .iter()
                        .map(|c| c.high)
                        .fold(f64::MIN, f64::max)
                        .max(entry)
                        + tick,
                }
            }
            StopLossKind::OppositeRange => match ctx.opening_range {
                Some(or) => match direction {
                    Direction::Long => or.low - tick,
                    Direction::Short => or.high + tick,
                },
                None => entry - sign * FALLBACK_STOP_TICKS * tick,
            },
        }
    }

    /// Profit target for an entry at `entry` with stop at `stop`.
    pub fn target_price(
        &self,
        direction: Direction,
        entry: f64,
        stop: f64,
        ctx: &EvaluationContext<'_>,
    ) -> f64 {
        let tick = self.tick_size();
        let rule = &self.rules.exit().take_profit;
        let sign = direction.sign();
        let risk = (entry - stop).abs();

        match rule.kind {
            TakeProfitKind::RrRatio => entry + sign * rule.value * risk,
            TakeProfitKind::FixedTicks => entry + sign * rule.value * tick,
            TakeProfitKind::OppositeRange => match ctx.opening_range {
                Some(or) => {
                    let range = or.high - or.low;
                    match direction {
                        Direction::Long => or.high + range,
                        Direction::Short => or.low - range,
                    }
                }
                None => entry + sign * 2.0 * risk,
            },
            // No structural projection yet; fall back to 2R.
            TakeProfitKind::Structure => entry + sign * 2.0 * risk,
        }
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Contracts to trade for the given account balance and levels, clamped
    /// to `[1, maxContracts]`.
    pub fn contract_quantity(&self, account_balance: f64, entry: f64, stop: f64) -> u32 {
        let risk = self.rules.risk();
        match risk.position_sizing {
            PositionSizing::FixedContracts => risk.max_contracts,
            PositionSizing::RiskPercent => {
                let instrument = self.rules.instrument();
                let ticks_at_risk = (entry - stop).abs() / instrument.tick_size;
                let risk_per_contract = ticks_at_risk * instrument.tick_value;
                if risk_per_contract <= 0.0 {
                    return 1;
                }
                let risk_budget = account_balance * risk.risk_percent / 100.0;
                let qty = (risk_budget / risk_per_contract).floor() as i64;
                qty.clamp(1, i64::from(risk.max_contracts)) as u32
            }
        }
    }
}

/// The next-to-last candle, when at least two exist.
fn prev_candle(candles: &[Ohlcv]) -> Option<&Ohlcv> {
    if candles.len() < 2 {
        return None;
    }
    candles.get(candles.len() - 2)
}
