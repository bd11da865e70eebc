// =============================================================================
// Order Manager — idempotent order lifecycle and fill reconciliation
// =============================================================================
//
// Invariants enforced here:
//   - At most one order row per setupId (idempotent create).
//   - At most one fill row per brokerFillId (idempotent recordFill).
//   - filledQty is always the sum of the order's fills and avgFillPrice the
//     quantity-weighted mean.
//   - An order with a blocked safety violation never reaches the broker.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerGateway, PlaceOrderRequest};
use crate::errors::{EngineError, EngineResult, RecoveryAction};
use crate::instruments::Instrument;
use crate::persistence::{
    FillRepository, OrderRepository, PositionRepository, SafetyLimitRepository,
};
use crate::rules::session::eastern_today_at;
use crate::safety::{self, SafetyInputs, SafetyLimits};
use crate::types::{
    BracketType, Fill, Order, OrderAction, OrderStatus, OrderType, TimeInForce,
};

/// Everything needed to create an order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub broker_account_id: String,
    pub setup_id: Option<String>,
    /// Base instrument (e.g. "ES"); resolved to a contract at submit time.
    pub symbol: String,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub order_qty: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub parent_order_id: Option<String>,
    pub bracket_type: Option<BracketType>,
}

pub struct OrderManager {
    orders: Arc<dyn OrderRepository>,
    fills: Arc<dyn FillRepository>,
    positions: Arc<dyn PositionRepository>,
    limits: Arc<dyn SafetyLimitRepository>,
    broker: Arc<dyn BrokerGateway>,
}

impl OrderManager {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        fills: Arc<dyn FillRepository>,
        positions: Arc<dyn PositionRepository>,
        limits: Arc<dyn SafetyLimitRepository>,
        broker: Arc<dyn BrokerGateway>,
    ) -> Self {
        Self {
            orders,
            fills,
            positions,
            limits,
            broker,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade safety
    // -------------------------------------------------------------------------

    /// Today's realized + unrealized PnL in dollars across open positions.
    ///
    /// Position PnL rows are points x contracts; the instrument point value
    /// converts to dollars here.
    pub async fn daily_pnl_dollars(&self, account_id: &str) -> EngineResult<f64> {
        let open = self.positions.list_open(account_id).await?;
        let mut total = 0.0;
        for position in &open {
            let point_value = Instrument::from_contract_symbol(&position.symbol)
                .map(|i| i.point_value())
                .unwrap_or(1.0);
            total += (position.realized_pnl + position.unrealized_pnl) * point_value;
        }
        Ok(total)
    }

    /// Evaluate the pre-trade checks for a prospective order.
    pub async fn pre_trade_check(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
        order_qty: u32,
    ) -> EngineResult<Vec<safety::Violation>> {
        let account_limits = self.limits.get_for_account(account_id).await?;
        let strategy_limits = match strategy_id {
            Some(id) => self.limits.get_for_strategy(id).await?,
            None => None,
        };
        let limits = SafetyLimits::merged(account_limits.as_ref(), strategy_limits.as_ref());

        let open_positions = self.positions.list_open(account_id).await?.len() as u32;
        let midnight = eastern_today_at(Utc::now(), 0);
        let orders_today = self.orders.count_since(account_id, midnight).await?;
        let daily_pnl = self.daily_pnl_dollars(account_id).await?;

        Ok(safety::evaluate(
            &limits,
            &SafetyInputs {
                order_qty,
                open_positions,
                orders_today,
                daily_pnl,
            },
        ))
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Create an order row. Idempotent on `setup_id`: if a row with that
    /// setup already exists it is returned unchanged and nothing else runs.
    pub async fn create_order(&self, input: NewOrder) -> EngineResult<Order> {
        if let Some(setup_id) = &input.setup_id {
            if let Some(existing) = self.orders.find_by_setup_id(setup_id).await? {
                debug!(setup_id, order_id = %existing.id, "order exists for setup — returning as-is");
                return Ok(existing);
            }
        }

        let violations = self
            .pre_trade_check(
                &input.broker_account_id,
                input.strategy_id.as_deref(),
                input.order_qty,
            )
            .await?;
        if let Some(blocker) = safety::first_blocker(&violations) {
            return Err(EngineError::SafetyLimit {
                violation: blocker.clone(),
            });
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            strategy_id: input.strategy_id,
            broker_account_id: input.broker_account_id,
            setup_id: input.setup_id,
            broker_order_id: None,
            symbol: input.symbol,
            action: input.action,
            order_type: input.order_type,
            order_qty: input.order_qty,
            price: input.price,
            stop_price: input.stop_price,
            time_in_force: input.time_in_force,
            filled_qty: 0,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            reject_reason: None,
            parent_order_id: input.parent_order_id,
            bracket_type: input.bracket_type,
            created_at: now,
            submitted_at: None,
            filled_at: None,
            updated_at: now,
            submit_latency_ms: None,
        };

        let order = self.orders.insert(order).await?;
        info!(order_id = %order.id, symbol = %order.symbol, qty = order.order_qty, "order created");
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Submit
    // -------------------------------------------------------------------------

    /// Resolve the contract, place the order with the broker, and record the
    /// acknowledgement. On failure the row is marked Rejected and an
    /// `OrderExecution` error surfaces to the caller.
    pub async fn submit_order(&self, order_id: &str) -> EngineResult<Order> {
        let mut order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("order {order_id} not found")))?;

        if order.status != OrderStatus::Pending {
            return Err(EngineError::Internal(format!(
                "order {order_id} is {} — only Pending orders can be submitted",
                order.status
            )));
        }

        let resolved = match self.broker.resolve_symbol(&order.symbol, true).await {
            Ok(resolved) => resolved,
            Err(e) => return self.mark_rejected(order, e).await,
        };

        let request = PlaceOrderRequest {
            symbol: resolved.symbol.clone(),
            action: order.action,
            order_type: order.order_type,
            order_qty: order.order_qty,
            price: order.price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
            custom_tag_50: order.setup_id.clone(),
        };

        let started = Instant::now();
        let ack = match self.broker.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => return self.mark_rejected(order, e).await,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let now = Utc::now();
        order.symbol = resolved.symbol;
        order.broker_order_id = Some(ack.broker_order_id);
        order.status = ack.status;
        order.filled_qty = ack.filled_qty;
        order.avg_fill_price = ack.avg_fill_price;
        order.submitted_at = Some(now);
        order.submit_latency_ms = Some(latency_ms);
        if ack.status == OrderStatus::Filled {
            order.filled_at = Some(now);
        }
        order.updated_at = now;

        let order = self.orders.update(order).await?;
        info!(
            order_id = %order.id,
            broker_order_id = ?order.broker_order_id,
            status = %order.status,
            latency_ms,
            "order submitted"
        );
        Ok(order)
    }

    async fn mark_rejected(&self, mut order: Order, cause: EngineError) -> EngineResult<Order> {
        warn!(order_id = %order.id, error = %cause, "order submission failed");
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(cause.to_string());
        order.updated_at = Utc::now();
        let order = self.orders.update(order).await?;

        let recovery = if cause.retryable() {
            RecoveryAction::Retry
        } else if matches!(cause, EngineError::CircuitOpen { .. }) {
            RecoveryAction::Alert
        } else {
            RecoveryAction::Skip
        };
        Err(EngineError::OrderExecution {
            order_id: Some(order.id),
            recovery,
            message: cause.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Status updates & fills
    // -------------------------------------------------------------------------

    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_qty: Option<u32>,
        avg_fill_price: Option<f64>,
    ) -> EngineResult<Order> {
        let mut order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("order {order_id} not found")))?;

        order.status = status;
        if let Some(qty) = filled_qty {
            order.filled_qty = qty;
        }
        if let Some(price) = avg_fill_price {
            order.avg_fill_price = Some(price);
        }
        let now = Utc::now();
        if status == OrderStatus::Filled && order.filled_at.is_none() {
            order.filled_at = Some(now);
        }
        order.updated_at = now;

        debug!(order_id, status = %status, "order status updated");
        self.orders.update(order).await
    }

    /// Record one broker fill. Idempotent on `broker_fill_id`: a repeated
    /// report returns the existing row without touching the order.
    pub async fn record_fill(
        &self,
        order_id: &str,
        broker_fill_id: &str,
        qty: u32,
        price: f64,
        commission: f64,
        fill_timestamp: DateTime<Utc>,
    ) -> EngineResult<Fill> {
        if let Some(existing) = self.fills.find_by_broker_fill_id(broker_fill_id).await? {
            debug!(broker_fill_id, "fill already recorded — returning existing");
            return Ok(existing);
        }

        let fill = self
            .fills
            .insert(Fill {
                id: Uuid::new_v4().to_string(),
                order_id: order_id.to_string(),
                broker_fill_id: Some(broker_fill_id.to_string()),
                qty,
                price,
                commission,
                fill_timestamp,
            })
            .await?;

        self.recalculate_order_fills(order_id).await?;
        info!(order_id, broker_fill_id, qty, price, "fill recorded");
        Ok(fill)
    }

    /// Re-derive the order's fill aggregate from its fills.
    pub async fn recalculate_order_fills(&self, order_id: &str) -> EngineResult<Order> {
        let mut order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("order {order_id} not found")))?;
        let fills = self.fills.list_by_order(order_id).await?;

        let total_qty: u32 = fills.iter().map(|f| f.qty).sum();
        let avg_price = if total_qty > 0 {
            let weighted: f64 = fills.iter().map(|f| f.qty as f64 * f.price).sum();
            Some(weighted / total_qty as f64)
        } else {
            None
        };

        order.filled_qty = total_qty;
        order.avg_fill_price = avg_price;
        order.status = if total_qty >= order.order_qty {
            OrderStatus::Filled
        } else if total_qty > 0 {
            OrderStatus::PartialFill
        } else {
            OrderStatus::Working
        };
        let now = Utc::now();
        if order.status == OrderStatus::Filled && order.filled_at.is_none() {
            order.filled_at = Some(now);
        }
        order.updated_at = now;

        self.orders.update(order).await
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Compare every non-terminal order against the broker and apply any
    /// drift. Invoked after market-data reconnection.
    pub async fn reconcile_orders(&self, account_id: &str) -> EngineResult<u32> {
        let open = self.orders.list_non_terminal(account_id).await?;
        let mut reconciled = 0;

        for order in open {
            let Some(broker_order_id) = &order.broker_order_id else {
                continue;
            };
            match self.broker.order_status(broker_order_id).await {
                Ok(snapshot) => {
                    let drifted = snapshot.status != order.status
                        || snapshot.filled_qty != order.filled_qty
                        || snapshot.avg_fill_price != order.avg_fill_price;
                    if drifted {
                        warn!(
                            order_id = %order.id,
                            local = %order.status,
                            broker = %snapshot.status,
                            "order drift detected — applying broker state"
                        );
                        self.update_order_status(
                            &order.id,
                            snapshot.status,
                            Some(snapshot.filled_qty),
                            snapshot.avg_fill_price,
                        )
                        .await?;
                        reconciled += 1;
                    }
                }
                Err(e) => warn!(order_id = %order.id, error = %e, "reconcile fetch failed"),
            }
        }

        if reconciled > 0 {
            info!(reconciled, "order reconciliation applied updates");
        }
        Ok(reconciled)
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager").finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerOrderSnapshot, BrokerPosition, PlaceOrderAck, ResolvedSymbol, RolloverStatus,
    };
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Recording broker stub: counts calls and returns scripted results.
    #[derive(Default)]
    struct StubBroker {
        place_calls: AtomicU32,
        fail_place: parking_lot::RwLock<Option<EngineError>>,
        last_request: Mutex<Option<PlaceOrderRequest>>,
        status: parking_lot::RwLock<Option<BrokerOrderSnapshot>>,
    }

    #[async_trait]
    impl BrokerGateway for StubBroker {
        async fn place_order(&self, request: &PlaceOrderRequest) -> EngineResult<PlaceOrderAck> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock() = Some(request.clone());
            if let Some(err) = self.fail_place.write().take() {
                return Err(err);
            }
            Ok(PlaceOrderAck {
                broker_order_id: "br-1".into(),
                status: OrderStatus::Working,
                filled_qty: 0,
                avg_fill_price: None,
            })
        }

        async fn cancel_order(&self, _broker_order_id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn modify_order(
            &self,
            _broker_order_id: &str,
            _price: Option<f64>,
            _stop_price: Option<f64>,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn order_status(&self, _broker_order_id: &str) -> EngineResult<BrokerOrderSnapshot> {
            self.status
                .read()
                .clone()
                .ok_or_else(|| EngineError::broker("NotFound", Some(404), "no status scripted"))
        }

        async fn list_positions(&self) -> EngineResult<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }

        async fn close_position(&self, _symbol: &str) -> EngineResult<Option<String>> {
            Ok(None)
        }

        async fn cash_balance(&self) -> EngineResult<f64> {
            Ok(50_000.0)
        }

        async fn resolve_symbol(
            &self,
            base: &str,
            _check_positions: bool,
        ) -> EngineResult<ResolvedSymbol> {
            Ok(ResolvedSymbol {
                symbol: format!("{base}H6"),
                status: RolloverStatus::Normal,
            })
        }
    }

    fn new_order(setup_id: Option<&str>, qty: u32) -> NewOrder {
        NewOrder {
            user_id: "user-1".into(),
            strategy_id: Some("strat-1".into()),
            broker_account_id: "acct-1".into(),
            setup_id: setup_id.map(str::to_string),
            symbol: "ES".into(),
            action: OrderAction::Buy,
            order_type: OrderType::Market,
            order_qty: qty,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            parent_order_id: None,
            bracket_type: None,
        }
    }

    fn build() -> (OrderManager, Arc<MemoryStore>, Arc<StubBroker>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(StubBroker::default());
        let manager = OrderManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            broker.clone(),
        );
        (manager, store, broker)
    }

    #[tokio::test]
    async fn create_order_idempotent_on_setup_id() {
        let (manager, store, _) = build();
        let first = manager.create_order(new_order(Some("setup-1"), 1)).await.unwrap();
        let second = manager.create_order(new_order(Some("setup-1"), 1)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn blocked_safety_check_prevents_creation() {
        let (manager, store, _) = build();
        store.seed_account_limits(
            "acct-1",
            SafetyLimits {
                max_position_size: Some(2),
                ..Default::default()
            },
        );
        let result = manager.create_order(new_order(None, 3)).await;
        assert!(matches!(result, Err(EngineError::SafetyLimit { .. })));
        assert_eq!(store.order_count(), 0);
    }

    /// Safety enforcement end to end: a blocked order never contacts the
    /// broker.
    #[tokio::test]
    async fn blocked_order_never_reaches_broker() {
        let (manager, store, broker) = build();
        store.seed_strategy_limits(
            "strat-1",
            SafetyLimits {
                max_daily_trades: Some(0),
                ..Default::default()
            },
        );
        let result = manager.create_order(new_order(Some("setup-z"), 1)).await;
        assert!(result.is_err());
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_resolves_contract_and_carries_setup_tag() {
        let (manager, _, broker) = build();
        let order = manager.create_order(new_order(Some("setup-7"), 2)).await.unwrap();
        let submitted = manager.submit_order(&order.id).await.unwrap();

        assert_eq!(submitted.symbol, "ESH6");
        assert_eq!(submitted.status, OrderStatus::Working);
        assert_eq!(submitted.broker_order_id.as_deref(), Some("br-1"));
        assert!(submitted.submitted_at.is_some());
        assert!(submitted.submit_latency_ms.is_some());

        let request = broker.last_request.lock().clone().unwrap();
        assert_eq!(request.custom_tag_50.as_deref(), Some("setup-7"));
        assert_eq!(request.order_qty, 2);
    }

    #[tokio::test]
    async fn submit_failure_marks_rejected() {
        let (manager, _, broker) = build();
        *broker.fail_place.write() =
            Some(EngineError::broker("Reject", Some(400), "insufficient margin"));
        let order = manager.create_order(new_order(None, 1)).await.unwrap();

        let result = manager.submit_order(&order.id).await;
        match result {
            Err(EngineError::OrderExecution { order_id, recovery, .. }) => {
                assert_eq!(order_id.as_deref(), Some(order.id.as_str()));
                assert_eq!(recovery, RecoveryAction::Skip);
            }
            other => panic!("expected OrderExecution error, got {other:?}"),
        }

        let stored = manager.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert!(stored.reject_reason.unwrap().contains("insufficient margin"));
    }

    #[tokio::test]
    async fn submit_retryable_failure_reports_retry() {
        let (manager, _, broker) = build();
        *broker.fail_place.write() =
            Some(EngineError::broker("GatewayTimeout", Some(504), "upstream"));
        let order = manager.create_order(new_order(None, 1)).await.unwrap();
        match manager.submit_order(&order.id).await {
            Err(EngineError::OrderExecution { recovery, .. }) => {
                assert_eq!(recovery, RecoveryAction::Retry);
            }
            other => panic!("expected OrderExecution, got {other:?}"),
        }
    }

    /// Recording the same broker fill twice yields exactly one fill row,
    /// filledQty 1, avgFillPrice 100.
    #[tokio::test]
    async fn record_fill_idempotent_on_broker_fill_id() {
        let (manager, _, _) = build();
        let order = manager.create_order(new_order(None, 1)).await.unwrap();
        let ts = Utc::now();

        let first = manager
            .record_fill(&order.id, "42", 1, 100.0, 1.0, ts)
            .await
            .unwrap();
        let second = manager
            .record_fill(&order.id, "42", 1, 100.0, 1.0, ts)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let fills = manager.fills.list_by_order(&order.id).await.unwrap();
        assert_eq!(fills.len(), 1);

        let stored = manager.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.filled_qty, 1);
        assert_eq!(stored.avg_fill_price, Some(100.0));
        assert_eq!(stored.status, OrderStatus::Filled);
        assert!(stored.filled_at.is_some());
    }

    #[tokio::test]
    async fn partial_fills_aggregate_weighted_average() {
        let (manager, _, _) = build();
        let order = manager.create_order(new_order(None, 3)).await.unwrap();
        let ts = Utc::now();

        manager.record_fill(&order.id, "f-1", 1, 100.0, 0.5, ts).await.unwrap();
        let stored = manager.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::PartialFill);
        assert_eq!(stored.filled_qty, 1);

        manager.record_fill(&order.id, "f-2", 2, 103.0, 1.0, ts).await.unwrap();
        let stored = manager.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(stored.filled_qty, 3);
        // (1*100 + 2*103) / 3 = 102
        assert!((stored.avg_fill_price.unwrap() - 102.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn reconcile_applies_broker_drift() {
        let (manager, _, broker) = build();
        let order = manager.create_order(new_order(None, 2)).await.unwrap();
        manager.submit_order(&order.id).await.unwrap();

        *broker.status.write() = Some(BrokerOrderSnapshot {
            status: OrderStatus::Filled,
            filled_qty: 2,
            avg_fill_price: Some(5000.5),
        });

        let reconciled = manager.reconcile_orders("acct-1").await.unwrap();
        assert_eq!(reconciled, 1);

        let stored = manager.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(stored.filled_qty, 2);
        assert_eq!(stored.avg_fill_price, Some(5000.5));

        // A second pass with no drift applies nothing.
        let reconciled = manager.reconcile_orders("acct-1").await.unwrap();
        assert_eq!(reconciled, 0);
    }

    #[tokio::test]
    async fn reconcile_skips_orders_without_broker_id() {
        let (manager, _, _) = build();
        manager.create_order(new_order(None, 1)).await.unwrap();
        let reconciled = manager.reconcile_orders("acct-1").await.unwrap();
        assert_eq!(reconciled, 0);
    }
}
