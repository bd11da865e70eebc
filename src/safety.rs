// =============================================================================
// Pre-trade Safety Limits
// =============================================================================
//
// Four ordered checks protect the account; any `blocked` violation stops an
// order before it reaches the broker:
//
//   1. Order quantity exceeds the max position size.
//   2. Open position count is at the concurrency cap.
//   3. Orders since midnight hit the daily trade cap.
//   4. Today's realized + unrealized PnL breaches the daily loss cap.
//
// The evaluation is pure; callers (order manager pre-trade, engine sweep)
// supply the current counters.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Limits & violations
// ---------------------------------------------------------------------------

/// Limits configured for an account or a single strategy. Absent fields are
/// unconstrained. When both account and strategy limits exist, the strategy
/// value wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_position_size: Option<u32>,
    pub max_concurrent_positions: Option<u32>,
    pub max_daily_trades: Option<u32>,
    /// Dollars of daily loss tolerated before trading halts.
    pub max_daily_loss: Option<f64>,
}

impl SafetyLimits {
    /// Merge account limits with per-strategy overrides.
    pub fn merged(account: Option<&SafetyLimits>, strategy: Option<&SafetyLimits>) -> SafetyLimits {
        let account = account.cloned().unwrap_or_default();
        let strategy = strategy.cloned().unwrap_or_default();
        SafetyLimits {
            max_position_size: strategy.max_position_size.or(account.max_position_size),
            max_concurrent_positions: strategy
                .max_concurrent_positions
                .or(account.max_concurrent_positions),
            max_daily_trades: strategy.max_daily_trades.or(account.max_daily_trades),
            max_daily_loss: strategy.max_daily_loss.or(account.max_daily_loss),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Blocked,
}

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyRule {
    MaxPositionSize,
    MaxConcurrentPositions,
    MaxDailyTrades,
    MaxDailyLoss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: SafetyRule,
    pub severity: ViolationSeverity,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Current account counters supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyInputs {
    pub order_qty: u32,
    pub open_positions: u32,
    pub orders_today: u32,
    /// Realized + unrealized PnL since midnight, in dollars.
    pub daily_pnl: f64,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate all four checks in order, collecting every violation.
pub fn evaluate(limits: &SafetyLimits, inputs: &SafetyInputs) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(max_size) = limits.max_position_size {
        if inputs.order_qty > max_size {
            violations.push(Violation {
                rule: SafetyRule::MaxPositionSize,
                severity: ViolationSeverity::Blocked,
                message: format!(
                    "order qty {} exceeds max position size {max_size}",
                    inputs.order_qty
                ),
            });
        }
    }

    if let Some(max_open) = limits.max_concurrent_positions {
        if inputs.open_positions >= max_open {
            violations.push(Violation {
                rule: SafetyRule::MaxConcurrentPositions,
                severity: ViolationSeverity::Blocked,
                message: format!(
                    "{} open positions at the {max_open}-position cap",
                    inputs.open_positions
                ),
            });
        }
    }

    if let Some(max_trades) = limits.max_daily_trades {
        if inputs.orders_today >= max_trades {
            violations.push(Violation {
                rule: SafetyRule::MaxDailyTrades,
                severity: ViolationSeverity::Blocked,
                message: format!(
                    "{} orders today at the {max_trades}-trade daily cap",
                    inputs.orders_today
                ),
            });
        }
    }

    if let Some(max_loss) = limits.max_daily_loss {
        if inputs.daily_pnl <= -max_loss {
            violations.push(Violation {
                rule: SafetyRule::MaxDailyLoss,
                severity: ViolationSeverity::Blocked,
                message: format!(
                    "daily PnL {:.2} breaches the -{max_loss:.2} loss cap",
                    inputs.daily_pnl
                ),
            });
        }
    }

    for v in &violations {
        warn!(rule = ?v.rule, message = %v.message, "safety violation");
    }
    violations
}

/// Whether an order submission is permitted: true iff no blocked violation.
pub fn is_permitted(violations: &[Violation]) -> bool {
    !violations
        .iter()
        .any(|v| v.severity == ViolationSeverity::Blocked)
}

/// The first blocking violation, used for error reporting.
pub fn first_blocker(violations: &[Violation]) -> Option<&Violation> {
    violations
        .iter()
        .find(|v| v.severity == ViolationSeverity::Blocked)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SafetyLimits {
        SafetyLimits {
            max_position_size: Some(5),
            max_concurrent_positions: Some(3),
            max_daily_trades: Some(10),
            max_daily_loss: Some(1000.0),
        }
    }

    #[test]
    fn clean_inputs_pass() {
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 2,
                open_positions: 1,
                orders_today: 4,
                daily_pnl: -200.0,
            },
        );
        assert!(violations.is_empty());
        assert!(is_permitted(&violations));
    }

    #[test]
    fn oversized_order_blocked() {
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 6,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, SafetyRule::MaxPositionSize);
        assert!(!is_permitted(&violations));
    }

    #[test]
    fn position_cap_is_inclusive() {
        // At the cap (not merely above it) the next position is blocked.
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 1,
                open_positions: 3,
                ..Default::default()
            },
        );
        assert_eq!(violations[0].rule, SafetyRule::MaxConcurrentPositions);
    }

    #[test]
    fn daily_trade_cap_is_inclusive() {
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 1,
                orders_today: 10,
                ..Default::default()
            },
        );
        assert_eq!(violations[0].rule, SafetyRule::MaxDailyTrades);
    }

    #[test]
    fn daily_loss_breach_blocked() {
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 1,
                daily_pnl: -1000.0, // exactly at the cap counts as breached
                ..Default::default()
            },
        );
        assert_eq!(violations[0].rule, SafetyRule::MaxDailyLoss);

        let ok = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 1,
                daily_pnl: -999.99,
                ..Default::default()
            },
        );
        assert!(ok.is_empty());
    }

    #[test]
    fn multiple_violations_all_collected_in_order() {
        let violations = evaluate(
            &limits(),
            &SafetyInputs {
                order_qty: 9,
                open_positions: 5,
                orders_today: 20,
                daily_pnl: -5000.0,
            },
        );
        assert_eq!(violations.len(), 4);
        assert_eq!(violations[0].rule, SafetyRule::MaxPositionSize);
        assert_eq!(violations[3].rule, SafetyRule::MaxDailyLoss);
        assert_eq!(
            first_blocker(&violations).unwrap().rule,
            SafetyRule::MaxPositionSize
        );
    }

    #[test]
    fn absent_limits_do_not_constrain() {
        let violations = evaluate(
            &SafetyLimits::default(),
            &SafetyInputs {
                order_qty: 100,
                open_positions: 50,
                orders_today: 500,
                daily_pnl: -1_000_000.0,
            },
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn strategy_limits_override_account_limits() {
        let account = SafetyLimits {
            max_position_size: Some(10),
            max_daily_trades: Some(50),
            ..Default::default()
        };
        let strategy = SafetyLimits {
            max_position_size: Some(2),
            ..Default::default()
        };
        let merged = SafetyLimits::merged(Some(&account), Some(&strategy));
        assert_eq!(merged.max_position_size, Some(2));
        assert_eq!(merged.max_daily_trades, Some(50));
        assert_eq!(merged.max_concurrent_positions, None);
    }
}
