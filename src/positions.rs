// =============================================================================
// Position Manager — open / update / close managed positions
// =============================================================================
//
// Positions are built from order fills and live in persistence; this manager
// is the only component that mutates position rows.
//
// PnL convention: `unrealized_pnl` and `realized_pnl` are price difference
// times quantity (points x contracts). Converting to dollars requires the
// instrument point value and is the caller's responsibility.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::persistence::PositionRepository;
use crate::types::{
    CloseReason, Direction, Order, OrderAction, Position, PositionStatus,
};

/// Per-strategy open risk for one account.
#[derive(Debug, Clone, Default)]
pub struct AccountRisk {
    /// Sum of |entry - stop| * netQty per strategy id ("unassigned" for
    /// discretionary positions).
    pub by_strategy: HashMap<String, f64>,
    pub total: f64,
}

pub struct PositionManager {
    repo: Arc<dyn PositionRepository>,
}

impl PositionManager {
    pub fn new(repo: Arc<dyn PositionRepository>) -> Self {
        Self { repo }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a position from a filled (or partially filled) entry order.
    pub async fn open_position(
        &self,
        order: &Order,
        stop_price: Option<f64>,
        target_price: Option<f64>,
    ) -> EngineResult<Position> {
        if order.filled_qty == 0 {
            return Err(EngineError::Internal(format!(
                "cannot open position from unfilled order {}",
                order.id
            )));
        }
        let avg_entry_price = order.avg_fill_price.ok_or_else(|| {
            EngineError::Internal(format!("order {} filled without an average price", order.id))
        })?;

        let direction = match order.action {
            OrderAction::Buy => Direction::Long,
            OrderAction::Sell => Direction::Short,
        };

        let position = Position {
            id: Uuid::new_v4().to_string(),
            user_id: order.user_id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            direction,
            net_qty: order.filled_qty,
            avg_entry_price,
            stop_price,
            target_price,
            stop_order_id: None,
            target_order_id: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            status: PositionStatus::Open,
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        };

        let position = self.repo.insert(position).await?;
        info!(
            id = %position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            qty = position.net_qty,
            entry = avg_entry_price,
            "position opened"
        );
        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Mark-to-market
    // -------------------------------------------------------------------------

    /// Recompute unrealized PnL at `current_price` and track the excursion
    /// extremes.
    pub async fn update_position_pnl(
        &self,
        position_id: &str,
        current_price: f64,
    ) -> EngineResult<Position> {
        let mut position = self
            .repo
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("position {position_id} not found")))?;

        if position.status == PositionStatus::Closed {
            warn!(id = position_id, "PnL update on a closed position ignored");
            return Ok(position);
        }

        let price_diff = match position.direction {
            Direction::Long => current_price - position.avg_entry_price,
            Direction::Short => position.avg_entry_price - current_price,
        };
        position.unrealized_pnl = price_diff * position.net_qty as f64;
        position.max_favorable_excursion = position
            .max_favorable_excursion
            .max(position.unrealized_pnl);
        position.max_adverse_excursion = position
            .max_adverse_excursion
            .min(position.unrealized_pnl);

        debug!(
            id = position_id,
            price = current_price,
            unrealized = position.unrealized_pnl,
            "position marked to market"
        );
        self.repo.update(position).await
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close at `close_price`, realize the PnL, and stamp the close reason.
    pub async fn close_position(
        &self,
        position_id: &str,
        close_price: f64,
        reason: CloseReason,
    ) -> EngineResult<Position> {
        let mut position = self
            .repo
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("position {position_id} not found")))?;

        if position.status == PositionStatus::Closed {
            return Ok(position);
        }

        let price_diff = match position.direction {
            Direction::Long => close_price - position.avg_entry_price,
            Direction::Short => position.avg_entry_price - close_price,
        };
        position.realized_pnl += price_diff * position.net_qty as f64;
        position.unrealized_pnl = 0.0;
        position.status = PositionStatus::Closed;
        position.close_reason = Some(reason);
        position.closed_at = Some(Utc::now());

        info!(
            id = position_id,
            close_price,
            realized = position.realized_pnl,
            reason = ?reason,
            "position closed"
        );
        self.repo.update(position).await
    }

    /// Attach protective order ids once the bracket legs are working.
    pub async fn attach_bracket_orders(
        &self,
        position_id: &str,
        stop_order_id: Option<String>,
        target_order_id: Option<String>,
    ) -> EngineResult<Position> {
        let mut position = self
            .repo
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("position {position_id} not found")))?;
        if stop_order_id.is_some() {
            position.stop_order_id = stop_order_id;
        }
        if target_order_id.is_some() {
            position.target_order_id = target_order_id;
        }
        self.repo.update(position).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn open_positions(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        self.repo.list_open(account_id).await
    }

    /// Aggregate open risk (|entry - stop| * netQty) per strategy.
    pub async fn account_risk(&self, account_id: &str) -> EngineResult<AccountRisk> {
        let open = self.repo.list_open(account_id).await?;
        let mut risk = AccountRisk::default();
        for position in &open {
            let Some(stop) = position.stop_price else {
                continue; // unprotected positions carry undefined risk
            };
            let per_position =
                (position.avg_entry_price - stop).abs() * position.net_qty as f64;
            let key = position
                .strategy_id
                .clone()
                .unwrap_or_else(|| "unassigned".to_string());
            *risk.by_strategy.entry(key).or_insert(0.0) += per_position;
            risk.total += per_position;
        }
        Ok(risk)
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager").finish()
    }
}
