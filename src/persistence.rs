// =============================================================================
// Persistence repositories — the typed contract the core calls into
// =============================================================================
//
// The relational store itself is an external collaborator; the engine only
// speaks through these traits. The in-memory implementation below backs demo
// mode and tests, and enforces the same unique constraints a database would
// (`setupId` on orders, `brokerFillId` on fills, the composite key on
// strategy state).
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::safety::SafetyLimits;
use crate::types::{Fill, Order, Position, PositionStatus, StrategyConfig};

// ---------------------------------------------------------------------------
// Strategy state rows
// ---------------------------------------------------------------------------

/// The kinds of intraday state a strategy may persist across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    OpeningRange,
    EmaAnchor,
    SessionStats,
    LastEntry,
    Cooldown,
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpeningRange => "opening_range",
            Self::EmaAnchor => "ema_anchor",
            Self::SessionStats => "session_stats",
            Self::LastEntry => "last_entry",
            Self::Cooldown => "cooldown",
        };
        write!(f, "{s}")
    }
}

/// One row of the strategy-state table, keyed by `(strategyId, stateType)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStateRow {
    pub strategy_id: String,
    pub state_type: StateType,
    pub payload: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Repository traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn list_active(&self, user_id: &str, account_id: &str)
        -> EngineResult<Vec<StrategyConfig>>;

    /// Persist an activation flip (quarantine auto-pause, daily-loss pause).
    async fn set_active(&self, strategy_id: &str, is_active: bool) -> EngineResult<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_by_setup_id(&self, setup_id: &str) -> EngineResult<Option<Order>>;

    async fn get(&self, order_id: &str) -> EngineResult<Option<Order>>;

    /// Insert a new row. Fails if another row already carries the same
    /// `setup_id` (unique constraint).
    async fn insert(&self, order: Order) -> EngineResult<Order>;

    async fn update(&self, order: Order) -> EngineResult<Order>;

    /// Orders not yet in a terminal state (for reconciliation).
    async fn list_non_terminal(&self, account_id: &str) -> EngineResult<Vec<Order>>;

    /// Orders created at or after `since` for the account.
    async fn count_since(&self, account_id: &str, since: DateTime<Utc>) -> EngineResult<u32>;
}

#[async_trait]
pub trait FillRepository: Send + Sync {
    async fn find_by_broker_fill_id(&self, broker_fill_id: &str) -> EngineResult<Option<Fill>>;

    /// Insert a new fill. Fails if `broker_fill_id` already exists.
    async fn insert(&self, fill: Fill) -> EngineResult<Fill>;

    async fn list_by_order(&self, order_id: &str) -> EngineResult<Vec<Fill>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn get(&self, position_id: &str) -> EngineResult<Option<Position>>;

    async fn insert(&self, position: Position) -> EngineResult<Position>;

    async fn update(&self, position: Position) -> EngineResult<Position>;

    async fn list_open(&self, account_id: &str) -> EngineResult<Vec<Position>>;
}

#[async_trait]
pub trait SafetyLimitRepository: Send + Sync {
    async fn get_for_account(&self, account_id: &str) -> EngineResult<Option<SafetyLimits>>;

    async fn get_for_strategy(&self, strategy_id: &str) -> EngineResult<Option<SafetyLimits>>;
}

#[async_trait]
pub trait StrategyStateRepository: Send + Sync {
    /// Upsert on the composite key; a conflict replaces the prior value.
    async fn upsert(&self, row: StrategyStateRow) -> EngineResult<()>;

    async fn get(&self, strategy_id: &str, state_type: StateType)
        -> EngineResult<Option<StrategyStateRow>>;

    async fn delete(&self, strategy_id: &str, state_type: StateType) -> EngineResult<()>;

    /// Non-expired rows for the given strategies.
    async fn list_active_for(
        &self,
        strategy_ids: &[String],
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<StrategyStateRow>>;

    /// Batch-delete every expired row; returns how many went away.
    async fn delete_expired(&self, now: DateTime<Utc>) -> EngineResult<u64>;
}

/// One-way audit log of setup detections.
#[async_trait]
pub trait BehavioralRepository: Send + Sync {
    async fn insert(&self, event: serde_json::Value) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory store backing demo mode and tests. A single struct implements
/// every repository trait, mirroring how the tables share one database.
#[derive(Default)]
pub struct MemoryStore {
    strategies: RwLock<Vec<StrategyConfig>>,
    orders: RwLock<HashMap<String, Order>>,
    fills: RwLock<HashMap<String, Fill>>,
    positions: RwLock<HashMap<String, Position>>,
    account_limits: RwLock<HashMap<String, SafetyLimits>>,
    strategy_limits: RwLock<HashMap<String, SafetyLimits>>,
    strategy_state: RwLock<HashMap<(String, StateType), StrategyStateRow>>,
    behavioral: RwLock<Vec<serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_strategy(&self, config: StrategyConfig) {
        self.strategies.write().push(config);
    }

    pub fn seed_account_limits(&self, account_id: &str, limits: SafetyLimits) {
        self.account_limits
            .write()
            .insert(account_id.to_string(), limits);
    }

    pub fn seed_strategy_limits(&self, strategy_id: &str, limits: SafetyLimits) {
        self.strategy_limits
            .write()
            .insert(strategy_id.to_string(), limits);
    }

    pub fn behavioral_events(&self) -> Vec<serde_json::Value> {
        self.behavioral.read().clone()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }
}

#[async_trait]
impl StrategyRepository for MemoryStore {
    async fn list_active(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> EngineResult<Vec<StrategyConfig>> {
        Ok(self
            .strategies
            .read()
            .iter()
            .filter(|s| s.user_id == user_id && s.broker_account_id == account_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn set_active(&self, strategy_id: &str, is_active: bool) -> EngineResult<()> {
        let mut strategies = self.strategies.write();
        for s in strategies.iter_mut() {
            if s.id == strategy_id {
                s.is_active = is_active;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn find_by_setup_id(&self, setup_id: &str) -> EngineResult<Option<Order>> {
        Ok(self
            .orders
            .read()
            .values()
            .find(|o| o.setup_id.as_deref() == Some(setup_id))
            .cloned())
    }

    async fn get(&self, order_id: &str) -> EngineResult<Option<Order>> {
        Ok(self.orders.read().get(order_id).cloned())
    }

    async fn insert(&self, order: Order) -> EngineResult<Order> {
        let mut orders = self.orders.write();
        // Unique constraint on setupId, checked under the same write lock
        // that performs the insert.
        if let Some(setup_id) = &order.setup_id {
            if orders
                .values()
                .any(|o| o.setup_id.as_deref() == Some(setup_id.as_str()))
            {
                return Err(EngineError::Internal(format!(
                    "unique constraint violated: order with setupId {setup_id} exists"
                )));
            }
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn update(&self, order: Order) -> EngineResult<Order> {
        let mut orders = self.orders.write();
        if !orders.contains_key(&order.id) {
            return Err(EngineError::Internal(format!(
                "order {} not found for update",
                order.id
            )));
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn list_non_terminal(&self, account_id: &str) -> EngineResult<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| o.broker_account_id == account_id && !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn count_since(&self, account_id: &str, since: DateTime<Utc>) -> EngineResult<u32> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| o.broker_account_id == account_id && o.created_at >= since)
            .count() as u32)
    }
}

#[async_trait]
impl FillRepository for MemoryStore {
    async fn find_by_broker_fill_id(&self, broker_fill_id: &str) -> EngineResult<Option<Fill>> {
        Ok(self
            .fills
            .read()
            .values()
            .find(|f| f.broker_fill_id.as_deref() == Some(broker_fill_id))
            .cloned())
    }

    async fn insert(&self, fill: Fill) -> EngineResult<Fill> {
        let mut fills = self.fills.write();
        if let Some(broker_fill_id) = &fill.broker_fill_id {
            if fills
                .values()
                .any(|f| f.broker_fill_id.as_deref() == Some(broker_fill_id.as_str()))
            {
                return Err(EngineError::Internal(format!(
                    "unique constraint violated: fill with brokerFillId {broker_fill_id} exists"
                )));
            }
        }
        fills.insert(fill.id.clone(), fill.clone());
        Ok(fill)
    }

    async fn list_by_order(&self, order_id: &str) -> EngineResult<Vec<Fill>> {
        let mut fills: Vec<Fill> = self
            .fills
            .read()
            .values()
            .filter(|f| f.order_id == order_id)
            .cloned()
            .collect();
        fills.sort_by_key(|f| f.fill_timestamp);
        Ok(fills)
    }
}

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn get(&self, position_id: &str) -> EngineResult<Option<Position>> {
        Ok(self.positions.read().get(position_id).cloned())
    }

    async fn insert(&self, position: Position) -> EngineResult<Position> {
        self.positions
            .write()
            .insert(position.id.clone(), position.clone());
        Ok(position)
    }

    async fn update(&self, position: Position) -> EngineResult<Position> {
        let mut positions = self.positions.write();
        if !positions.contains_key(&position.id) {
            return Err(EngineError::Internal(format!(
                "position {} not found for update",
                position.id
            )));
        }
        positions.insert(position.id.clone(), position.clone());
        Ok(position)
    }

    // The in-memory store holds a single account; the id only matters for
    // the SQL implementation's row filtering.
    async fn list_open(&self, _account_id: &str) -> EngineResult<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SafetyLimitRepository for MemoryStore {
    async fn get_for_account(&self, account_id: &str) -> EngineResult<Option<SafetyLimits>> {
        Ok(self.account_limits.read().get(account_id).cloned())
    }

    async fn get_for_strategy(&self, strategy_id: &str) -> EngineResult<Option<SafetyLimits>> {
        Ok(self.strategy_limits.read().get(strategy_id).cloned())
    }
}

#[async_trait]
impl StrategyStateRepository for MemoryStore {
    async fn upsert(&self, row: StrategyStateRow) -> EngineResult<()> {
        self.strategy_state
            .write()
            .insert((row.strategy_id.clone(), row.state_type), row);
        Ok(())
    }

    async fn get(
        &self,
        strategy_id: &str,
        state_type: StateType,
    ) -> EngineResult<Option<StrategyStateRow>> {
        Ok(self
            .strategy_state
            .read()
            .get(&(strategy_id.to_string(), state_type))
            .cloned())
    }

    async fn delete(&self, strategy_id: &str, state_type: StateType) -> EngineResult<()> {
        self.strategy_state
            .write()
            .remove(&(strategy_id.to_string(), state_type));
        Ok(())
    }

    async fn list_active_for(
        &self,
        strategy_ids: &[String],
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<StrategyStateRow>> {
        Ok(self
            .strategy_state
            .read()
            .values()
            .filter(|row| {
                strategy_ids.contains(&row.strategy_id)
                    && row.expires_at.map_or(true, |exp| exp > now)
            })
            .cloned()
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut state = self.strategy_state.write();
        let before = state.len();
        state.retain(|_, row| row.expires_at.map_or(true, |exp| exp > now));
        Ok((before - state.len()) as u64)
    }
}

#[async_trait]
impl BehavioralRepository for MemoryStore {
    async fn insert(&self, event: serde_json::Value) -> EngineResult<()> {
        self.behavioral.write().push(event);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderAction, OrderStatus, OrderType, TimeInForce};

    fn order(id: &str, setup_id: Option<&str>) -> Order {
        Order {
            id: id.to_string(),
            user_id: "user-1".into(),
            strategy_id: Some("strat-1".into()),
            broker_account_id: "acct-1".into(),
            setup_id: setup_id.map(str::to_string),
            broker_order_id: None,
            symbol: "ESH6".into(),
            action: OrderAction::Buy,
            order_type: OrderType::Market,
            order_qty: 1,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            filled_qty: 0,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            reject_reason: None,
            parent_order_id: None,
            bracket_type: None,
            created_at: Utc::now(),
            submitted_at: None,
            filled_at: None,
            updated_at: Utc::now(),
            submit_latency_ms: None,
        }
    }

    #[tokio::test]
    async fn order_setup_id_unique_constraint() {
        let store = MemoryStore::new();
        OrderRepository::insert(&store, order("o-1", Some("setup-1")))
            .await
            .unwrap();
        // Same setup id, different row id: rejected.
        assert!(OrderRepository::insert(&store, order("o-2", Some("setup-1")))
            .await
            .is_err());
        // No setup id: always allowed.
        OrderRepository::insert(&store, order("o-3", None)).await.unwrap();
        OrderRepository::insert(&store, order("o-4", None)).await.unwrap();
        assert_eq!(store.order_count(), 3);
    }

    #[tokio::test]
    async fn fill_broker_id_unique_constraint() {
        let store = MemoryStore::new();
        let fill = Fill {
            id: "f-1".into(),
            order_id: "o-1".into(),
            broker_fill_id: Some("bf-42".into()),
            qty: 1,
            price: 100.0,
            commission: 1.0,
            fill_timestamp: Utc::now(),
        };
        FillRepository::insert(&store, fill.clone()).await.unwrap();

        let dup = Fill {
            id: "f-2".into(),
            ..fill
        };
        assert!(FillRepository::insert(&store, dup).await.is_err());
    }

    #[tokio::test]
    async fn state_upsert_replaces_on_composite_key() {
        let store = MemoryStore::new();
        let row = |v: i64| StrategyStateRow {
            strategy_id: "strat-1".into(),
            state_type: StateType::Cooldown,
            payload: serde_json::json!({ "v": v }),
            calculated_at: Utc::now(),
            expires_at: None,
        };
        store.upsert(row(1)).await.unwrap();
        store.upsert(row(2)).await.unwrap();
        let stored = StrategyStateRepository::get(&store, "strat-1", StateType::Cooldown)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload["v"], 2);
    }

    #[tokio::test]
    async fn expired_state_filtered_and_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert(StrategyStateRow {
                strategy_id: "strat-1".into(),
                state_type: StateType::OpeningRange,
                payload: serde_json::json!({}),
                calculated_at: now,
                expires_at: Some(now - chrono::Duration::minutes(1)),
            })
            .await
            .unwrap();
        store
            .upsert(StrategyStateRow {
                strategy_id: "strat-1".into(),
                state_type: StateType::LastEntry,
                payload: serde_json::json!({}),
                calculated_at: now,
                expires_at: Some(now + chrono::Duration::hours(1)),
            })
            .await
            .unwrap();

        let active = store
            .list_active_for(&["strat-1".to_string()], now)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state_type, StateType::LastEntry);

        let deleted = store.delete_expired(now).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn list_active_filters_inactive_strategies() {
        let store = MemoryStore::new();
        let config = |id: &str, active: bool| StrategyConfig {
            id: id.to_string(),
            user_id: "user-1".into(),
            broker_account_id: "acct-1".into(),
            name: id.to_string(),
            rules: sample_rules(),
            autonomy_level: Default::default(),
            is_active: active,
            max_daily_loss: None,
            alerts_enabled: true,
        };
        store.seed_strategy(config("a", true));
        store.seed_strategy(config("b", false));

        let active = store.list_active("user-1", "acct-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");

        store.set_active("a", false).await.unwrap();
        assert!(store.list_active("user-1", "acct-1").await.unwrap().is_empty());
    }

    fn sample_rules() -> crate::rules::CanonicalRules {
        use crate::instruments::Instrument;
        use crate::rules::schema::*;
        CanonicalRules::Breakout {
            instrument: InstrumentSpec::standard(Instrument::Es),
            direction: DirectionFilter::Both,
            entry: BreakoutEntry {
                lookback_period: 20,
                level_type: BreakoutLevelType::Both,
                confirmation: BreakoutConfirmation::None,
            },
            exit: ExitRules {
                stop_loss: StopLossRule {
                    kind: StopLossKind::FixedTicks,
                    value: 10.0,
                },
                take_profit: TakeProfitRule {
                    kind: TakeProfitKind::RrRatio,
                    value: 2.0,
                },
            },
            risk: RiskRules {
                position_sizing: PositionSizing::RiskPercent,
                risk_percent: 1.0,
                max_contracts: 3,
            },
            time: TimeRules {
                session: Session::All,
                custom_start: None,
                custom_end: None,
                timezone: "America/New_York".to_string(),
            },
        }
    }
}
