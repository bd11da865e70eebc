// =============================================================================
// Symbol Rollover — contract resolution state machine
// =============================================================================
//
// Futures contracts expire; the tradable front month migrates over time.
// Days-until-expiry drives the per-base status:
//
//   > 7 days   normal
//   (5, 7]     switching
//   (2, 5]     warning
//   <= 2       imminent
//
// Policy override: while an open position exists in a contract within 3 days
// of expiry, resolution returns that contract unchanged — a rollover never
// breaks a live position.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::ResolvedSymbol;
use crate::errors::{EngineError, EngineResult};

/// Days-to-expiry below which a held position pins its contract.
const POSITION_HOLD_DAYS: i64 = 3;
/// Preferred liquidity filter: contracts with more than this many days left.
const PREFERRED_EXPIRY_DAYS: i64 = 7;
/// Fallback filter when nothing passes the preferred window.
const FALLBACK_EXPIRY_DAYS: i64 = 2;

/// A live contract as returned by the broker's contract list.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractInfo {
    pub symbol: String,
    pub base: String,
    pub expiry: DateTime<Utc>,
    pub daily_volume: f64,
}

/// Lifecycle position of a contract relative to its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloverStatus {
    Normal,
    Switching,
    Warning,
    Imminent,
}

impl std::fmt::Display for RolloverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Switching => "switching",
            Self::Warning => "warning",
            Self::Imminent => "imminent",
        };
        write!(f, "{s}")
    }
}

/// Alert severity for an approaching rollover (7/3/1-day thresholds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloverSeverity {
    None,
    Warning,
    Critical,
    Emergency,
}

/// Days until expiry, rounded down. Past expiry goes negative.
pub fn days_until_expiry(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiry - now).num_days()
}

/// Classify a contract's rollover status from its days to expiry.
pub fn status_for_days(days: i64) -> RolloverStatus {
    if days > 7 {
        RolloverStatus::Normal
    } else if days > 5 {
        RolloverStatus::Switching
    } else if days > 2 {
        RolloverStatus::Warning
    } else {
        RolloverStatus::Imminent
    }
}

/// Classify alert severity from days to expiry.
pub fn severity_for_days(days: i64) -> RolloverSeverity {
    if days <= 1 {
        RolloverSeverity::Emergency
    } else if days <= 3 {
        RolloverSeverity::Critical
    } else if days <= 7 {
        RolloverSeverity::Warning
    } else {
        RolloverSeverity::None
    }
}

/// Result of a rollover check for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloverCheck {
    pub severity: RolloverSeverity,
    pub next_symbol: Option<String>,
}

// ---------------------------------------------------------------------------
// Pure resolution policy
// ---------------------------------------------------------------------------

/// Pick the tradable contract for `base` from the live contract list.
///
/// `open_position_symbol` is the contract of an existing open position for
/// this base, if any; when that contract is within 3 days of expiry it is
/// returned unchanged with status `imminent` — the engine never switches
/// symbols under a live position.
pub fn resolve_contract(
    base: &str,
    contracts: &[ContractInfo],
    open_position_symbol: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<ResolvedSymbol> {
    if let Some(held) = open_position_symbol {
        if let Some(contract) = contracts.iter().find(|c| c.symbol == held) {
            let days = days_until_expiry(contract.expiry, now);
            if days < POSITION_HOLD_DAYS {
                warn!(
                    base,
                    symbol = held,
                    days,
                    "open position near expiry — holding contract through rollover"
                );
                return Ok(ResolvedSymbol {
                    symbol: held.to_string(),
                    status: RolloverStatus::Imminent,
                });
            }
        }
    }

    let pick = |min_days: i64| -> Option<&ContractInfo> {
        let mut eligible: Vec<&ContractInfo> = contracts
            .iter()
            .filter(|c| c.base == base && days_until_expiry(c.expiry, now) > min_days)
            .collect();
        eligible.sort_by(|a, b| {
            b.daily_volume
                .partial_cmp(&a.daily_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.expiry.cmp(&b.expiry))
        });
        eligible.first().copied()
    };

    let chosen = match pick(PREFERRED_EXPIRY_DAYS) {
        Some(c) => c,
        None => {
            let fallback = pick(FALLBACK_EXPIRY_DAYS).ok_or_else(|| {
                EngineError::Internal(format!("no tradable contract found for {base}"))
            })?;
            warn!(
                base,
                symbol = %fallback.symbol,
                "no contract beyond the 7-day window — falling back to near expiry"
            );
            fallback
        }
    };

    let days = days_until_expiry(chosen.expiry, now);
    Ok(ResolvedSymbol {
        symbol: chosen.symbol.clone(),
        status: status_for_days(days),
    })
}

/// Severity and candidate replacement for one contract symbol.
pub fn check_rollover(
    symbol: &str,
    contracts: &[ContractInfo],
    now: DateTime<Utc>,
) -> RolloverCheck {
    let Some(contract) = contracts.iter().find(|c| c.symbol == symbol) else {
        return RolloverCheck {
            severity: RolloverSeverity::None,
            next_symbol: None,
        };
    };

    let days = days_until_expiry(contract.expiry, now);
    let severity = severity_for_days(days);

    let next_symbol = if severity == RolloverSeverity::None {
        None
    } else {
        let mut candidates: Vec<&ContractInfo> = contracts
            .iter()
            .filter(|c| {
                c.base == contract.base
                    && c.symbol != symbol
                    && days_until_expiry(c.expiry, now) > PREFERRED_EXPIRY_DAYS
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.daily_volume
                .partial_cmp(&a.daily_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.expiry.cmp(&b.expiry))
        });
        candidates.first().map(|c| c.symbol.clone())
    };

    RolloverCheck {
        severity,
        next_symbol,
    }
}

// ---------------------------------------------------------------------------
// Per-base tracker
// ---------------------------------------------------------------------------

/// Per-base rollover state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RolloverState {
    pub current_symbol: String,
    pub next_symbol: Option<String>,
    pub rollover_date: Option<DateTime<Utc>>,
    pub status: RolloverStatus,
}

/// Tracks the resolved contract per base instrument.
#[derive(Debug, Default)]
pub struct RolloverTracker {
    states: RwLock<HashMap<String, RolloverState>>,
}

impl RolloverTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a resolution pass.
    pub fn record(
        &self,
        base: &str,
        resolved: &ResolvedSymbol,
        next_symbol: Option<String>,
        rollover_date: Option<DateTime<Utc>>,
    ) {
        let mut states = self.states.write();
        let changed = states
            .get(base)
            .map(|s| s.current_symbol != resolved.symbol || s.status != resolved.status)
            .unwrap_or(true);
        if changed {
            info!(
                base,
                symbol = %resolved.symbol,
                status = %resolved.status,
                "rollover state updated"
            );
        }
        states.insert(
            base.to_string(),
            RolloverState {
                current_symbol: resolved.symbol.clone(),
                next_symbol,
                rollover_date,
                status: resolved.status,
            },
        );
    }

    pub fn state(&self, base: &str) -> Option<RolloverState> {
        self.states.read().get(base).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, RolloverState)> {
        self.states
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()
    }

    fn contract(symbol: &str, base: &str, days_out: i64, volume: f64) -> ContractInfo {
        ContractInfo {
            symbol: symbol.to_string(),
            base: base.to_string(),
            expiry: now() + Duration::days(days_out),
            daily_volume: volume,
        }
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(status_for_days(30), RolloverStatus::Normal);
        assert_eq!(status_for_days(8), RolloverStatus::Normal);
        assert_eq!(status_for_days(7), RolloverStatus::Switching);
        assert_eq!(status_for_days(6), RolloverStatus::Switching);
        assert_eq!(status_for_days(5), RolloverStatus::Warning);
        assert_eq!(status_for_days(3), RolloverStatus::Warning);
        assert_eq!(status_for_days(2), RolloverStatus::Imminent);
        assert_eq!(status_for_days(0), RolloverStatus::Imminent);
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(severity_for_days(10), RolloverSeverity::None);
        assert_eq!(severity_for_days(7), RolloverSeverity::Warning);
        assert_eq!(severity_for_days(4), RolloverSeverity::Warning);
        assert_eq!(severity_for_days(3), RolloverSeverity::Critical);
        assert_eq!(severity_for_days(2), RolloverSeverity::Critical);
        assert_eq!(severity_for_days(1), RolloverSeverity::Emergency);
        assert_eq!(severity_for_days(0), RolloverSeverity::Emergency);
    }

    #[test]
    fn resolve_prefers_highest_volume_beyond_seven_days() {
        let contracts = vec![
            contract("ESH6", "ES", 10, 100_000.0),
            contract("ESM6", "ES", 100, 250_000.0),
            contract("ESU6", "ES", 190, 5_000.0),
        ];
        let resolved = resolve_contract("ES", &contracts, None, now()).unwrap();
        assert_eq!(resolved.symbol, "ESM6");
        assert_eq!(resolved.status, RolloverStatus::Normal);
    }

    #[test]
    fn resolve_breaks_volume_tie_by_soonest_expiry() {
        let contracts = vec![
            contract("ESM6", "ES", 100, 50_000.0),
            contract("ESH6", "ES", 30, 50_000.0),
        ];
        let resolved = resolve_contract("ES", &contracts, None, now()).unwrap();
        assert_eq!(resolved.symbol, "ESH6");
    }

    /// Open long in ESH6 with 2 days to expiry: resolution returns ESH6
    /// unchanged and reports imminent.
    #[test]
    fn open_position_near_expiry_pins_contract() {
        let contracts = vec![
            contract("ESH6", "ES", 2, 300_000.0),
            contract("ESM6", "ES", 93, 150_000.0),
        ];
        let resolved = resolve_contract("ES", &contracts, Some("ESH6"), now()).unwrap();
        assert_eq!(resolved.symbol, "ESH6");
        assert_eq!(resolved.status, RolloverStatus::Imminent);
    }

    #[test]
    fn open_position_far_from_expiry_does_not_pin() {
        let contracts = vec![
            contract("ESH6", "ES", 20, 300_000.0),
            contract("ESM6", "ES", 110, 350_000.0),
        ];
        // Held contract has 20 days left: normal resolution applies.
        let resolved = resolve_contract("ES", &contracts, Some("ESH6"), now()).unwrap();
        assert_eq!(resolved.symbol, "ESM6");
    }

    #[test]
    fn resolve_falls_back_to_two_day_filter() {
        let contracts = vec![
            contract("CLJ6", "CL", 4, 90_000.0),
            contract("CLK6", "CL", 6, 120_000.0),
        ];
        let resolved = resolve_contract("CL", &contracts, None, now()).unwrap();
        assert_eq!(resolved.symbol, "CLK6");
        assert_eq!(resolved.status, RolloverStatus::Switching);
    }

    #[test]
    fn resolve_errors_when_nothing_tradable() {
        let contracts = vec![contract("GCJ6", "GC", 1, 50_000.0)];
        assert!(resolve_contract("GC", &contracts, None, now()).is_err());
    }

    #[test]
    fn resolve_ignores_other_bases() {
        let contracts = vec![
            contract("NQH6", "NQ", 100, 500_000.0),
            contract("ESM6", "ES", 100, 100.0),
        ];
        let resolved = resolve_contract("ES", &contracts, None, now()).unwrap();
        assert_eq!(resolved.symbol, "ESM6");
    }

    #[test]
    fn check_rollover_reports_candidate() {
        let contracts = vec![
            contract("ESH6", "ES", 3, 300_000.0),
            contract("ESM6", "ES", 93, 150_000.0),
        ];
        let check = check_rollover("ESH6", &contracts, now());
        assert_eq!(check.severity, RolloverSeverity::Critical);
        assert_eq!(check.next_symbol.as_deref(), Some("ESM6"));
    }

    #[test]
    fn check_rollover_quiet_when_far_out() {
        let contracts = vec![contract("ESM6", "ES", 93, 150_000.0)];
        let check = check_rollover("ESM6", &contracts, now());
        assert_eq!(check.severity, RolloverSeverity::None);
        assert!(check.next_symbol.is_none());
    }

    #[test]
    fn tracker_records_state() {
        let tracker = RolloverTracker::new();
        tracker.record(
            "ES",
            &ResolvedSymbol {
                symbol: "ESM6".into(),
                status: RolloverStatus::Normal,
            },
            None,
            None,
        );
        let state = tracker.state("ES").unwrap();
        assert_eq!(state.current_symbol, "ESM6");
        assert_eq!(state.status, RolloverStatus::Normal);
        assert!(tracker.state("NQ").is_none());
    }
}
