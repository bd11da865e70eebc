// =============================================================================
// Broker module — authenticated REST client, symbol rollover, gateway trait
// =============================================================================

pub mod client;
pub mod rollover;

pub use client::BrokerClient;
pub use rollover::{ContractInfo, RolloverSeverity, RolloverStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;
use crate::types::{OrderAction, OrderStatus, OrderType, TimeInForce};

/// Order submission payload sent to the broker.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub order_qty: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    /// Engine setup id, carried for end-to-end idempotency.
    pub custom_tag_50: Option<String>,
}

/// Broker acknowledgement of an order submission.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderAck {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: u32,
    pub avg_fill_price: Option<f64>,
}

/// Broker-side view of an order, used during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrderSnapshot {
    pub status: OrderStatus,
    pub filled_qty: u32,
    pub avg_fill_price: Option<f64>,
}

/// One open position as reported by the broker.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub net_qty: i64,
}

/// A base instrument resolved to a tradable contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSymbol {
    pub symbol: String,
    pub status: RolloverStatus,
}

/// The surface the engine needs from the broker. `BrokerClient` implements
/// this against the real HTTPS API; tests substitute a recording stub.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn place_order(&self, request: &PlaceOrderRequest) -> EngineResult<PlaceOrderAck>;

    async fn cancel_order(&self, broker_order_id: &str) -> EngineResult<()>;

    async fn modify_order(
        &self,
        broker_order_id: &str,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> EngineResult<()>;

    async fn order_status(&self, broker_order_id: &str) -> EngineResult<BrokerOrderSnapshot>;

    async fn list_positions(&self) -> EngineResult<Vec<BrokerPosition>>;

    /// Close a position with a market order opposite the current net
    /// quantity. Returns the broker order id of the flattening order.
    async fn close_position(&self, symbol: &str) -> EngineResult<Option<String>>;

    async fn cash_balance(&self) -> EngineResult<f64>;

    /// Resolve a base instrument (e.g. "ES") to a tradable contract symbol,
    /// honouring the rollover policy.
    async fn resolve_symbol(&self, base: &str, check_positions: bool)
        -> EngineResult<ResolvedSymbol>;
}
