// =============================================================================
// Broker REST API Client — bearer-token authenticated requests
// =============================================================================
//
// SECURITY: the access token is never logged or serialized. Every request
// carries an Authorization header; the token is refreshed on a schedule ten
// minutes before it expires. Live and demo environments have different base
// URLs — the choice follows the account type.
//
// Order RPCs run behind the `broker:orders` breaker, market-data RPCs behind
// `broker:marketData`, token refresh behind `broker:auth`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::rollover::{
    check_rollover, days_until_expiry, resolve_contract, ContractInfo, RolloverCheck,
    RolloverTracker,
};
use crate::broker::{
    BrokerGateway, BrokerOrderSnapshot, BrokerPosition, PlaceOrderAck, PlaceOrderRequest,
    ResolvedSymbol,
};
use crate::circuit::{BreakerRegistry, CircuitBreaker, BREAKER_AUTH, BREAKER_MARKET_DATA, BREAKER_ORDERS};
use crate::errors::{EngineError, EngineResult};
use crate::market_data::BarSource;
use crate::types::{Ohlcv, OrderAction, OrderStatus};

/// Token refresh lead time before expiry.
const TOKEN_REFRESH_LEAD: ChronoDuration = ChronoDuration::minutes(10);

/// Broker REST client.
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    access_token: RwLock<String>,
    token_expires_at: RwLock<DateTime<Utc>>,
    orders_breaker: Arc<CircuitBreaker>,
    md_breaker: Arc<CircuitBreaker>,
    auth_breaker: Arc<CircuitBreaker>,
    rollover: RolloverTracker,
}

impl BrokerClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client against `base_url` with an initial token.
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        access_token: impl Into<String>,
        token_expires_at: DateTime<Utc>,
        breakers: &BreakerRegistry,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BrokerClient initialised");

        Self {
            http,
            base_url,
            account_id: account_id.into(),
            access_token: RwLock::new(access_token.into()),
            token_expires_at: RwLock::new(token_expires_at),
            orders_breaker: breakers
                .get(BREAKER_ORDERS)
                .expect("orders breaker registered at startup"),
            md_breaker: breakers
                .get(BREAKER_MARKET_DATA)
                .expect("market-data breaker registered at startup"),
            auth_breaker: breakers
                .get(BREAKER_AUTH)
                .expect("auth breaker registered at startup"),
            rollover: RolloverTracker::new(),
        }
    }

    /// Current token for the market-data socket authorization frame.
    pub fn access_token(&self) -> String {
        self.access_token.read().clone()
    }

    pub fn rollover_tracker(&self) -> &RolloverTracker {
        &self.rollover
    }

    // -------------------------------------------------------------------------
    // Token refresh
    // -------------------------------------------------------------------------

    /// Spawn the token-refresh schedule: renew at `expiresAt - 10 min`,
    /// repeating for each new token. Refresh failures count against the
    /// `broker:auth` breaker and surface as an error log for the engine's
    /// alert channel.
    pub fn spawn_token_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let expires_at = *client.token_expires_at.read();
                let refresh_at = expires_at - TOKEN_REFRESH_LEAD;
                let wait = (refresh_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                tokio::time::sleep(wait).await;

                match client.refresh_token().await {
                    Ok(new_expiry) => {
                        info!(expires_at = %new_expiry, "broker access token refreshed");
                    }
                    Err(e) => {
                        error!(error = %e, "broker token refresh failed");
                        // Back off a minute before retrying so a broken auth
                        // endpoint is not hammered.
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            }
        })
    }

    /// Renew the access token. Runs behind the auth breaker.
    pub async fn refresh_token(&self) -> EngineResult<DateTime<Utc>> {
        let body = self
            .auth_breaker
            .execute(|| self.post_json("/auth/renewAccessToken", json!({})))
            .await?;

        let token = body["accessToken"]
            .as_str()
            .ok_or_else(|| {
                EngineError::broker("MalformedResponse", None, "renew response missing accessToken")
            })?
            .to_string();
        let expires_at = body["expirationTime"]
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1));

        *self.access_token.write() = token;
        *self.token_expires_at.write() = expires_at;
        Ok(expires_at)
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing
    // -------------------------------------------------------------------------

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.access_token.read().clone();

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::broker("Network", None, format!("POST {path}: {e}")))?;

        Self::decode_response(path, response).await
    }

    async fn get_json(&self, path: &str) -> EngineResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.access_token.read().clone();

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| EngineError::broker("Network", None, format!("GET {path}: {e}")))?;

        Self::decode_response(path, response).await
    }

    async fn decode_response(
        path: &str,
        response: reqwest::Response,
    ) -> EngineResult<serde_json::Value> {
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            let code = body["errorCode"]
                .as_str()
                .unwrap_or(status.canonical_reason().unwrap_or("HttpError"))
                .to_string();
            let message = body["errorText"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{path} returned {status}"));
            return Err(EngineError::broker(code, Some(status.as_u16()), message));
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Response parsing (kept separate so it is testable without HTTP)
    // -------------------------------------------------------------------------

    fn parse_order_status(value: &serde_json::Value) -> OrderStatus {
        match value.as_str().unwrap_or_default() {
            "Working" => OrderStatus::Working,
            "PartialFill" => OrderStatus::PartialFill,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "Canceled" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            "Expired" => OrderStatus::Expired,
            _ => OrderStatus::Pending,
        }
    }

    fn parse_order_ack(body: &serde_json::Value) -> EngineResult<PlaceOrderAck> {
        let broker_order_id = body["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(str::to_string))
            .ok_or_else(|| {
                EngineError::broker("MalformedResponse", None, "order ack missing orderId")
            })?;
        Ok(PlaceOrderAck {
            broker_order_id,
            status: Self::parse_order_status(&body["orderStatus"]),
            filled_qty: body["filledQty"].as_u64().unwrap_or(0) as u32,
            avg_fill_price: body["avgFillPrice"].as_f64(),
        })
    }

    fn parse_contracts(body: &serde_json::Value) -> Vec<ContractInfo> {
        body.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        let expiry_ms = c["expirationTimestamp"].as_i64()?;
                        Some(ContractInfo {
                            symbol: c["name"].as_str()?.to_string(),
                            base: c["productCode"].as_str()?.to_string(),
                            expiry: Utc.timestamp_millis_opt(expiry_ms).single()?,
                            daily_volume: c["dailyVolume"].as_f64().unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_bars(body: &serde_json::Value) -> Vec<Ohlcv> {
        body["bars"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| {
                        let ts = b["timestamp"].as_i64()?;
                        Some(Ohlcv {
                            timestamp: Utc.timestamp_millis_opt(ts).single()?,
                            open: b["open"].as_f64()?,
                            high: b["high"].as_f64()?,
                            low: b["low"].as_f64()?,
                            close: b["close"].as_f64()?,
                            volume: b["volume"].as_f64().unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Contract discovery
    // -------------------------------------------------------------------------

    /// List live contracts for a base instrument.
    #[instrument(skip(self), name = "broker::find_contracts")]
    pub async fn find_contracts(&self, base: &str) -> EngineResult<Vec<ContractInfo>> {
        let path = format!("/contract/find?name={base}");
        let body = self
            .md_breaker
            .execute(|| self.get_json(&path))
            .await?;
        let contracts = Self::parse_contracts(&body);
        debug!(base, count = contracts.len(), "contracts fetched");
        Ok(contracts)
    }

    /// Rollover severity and candidate next contract for `symbol`.
    pub async fn check_rollover(&self, symbol: &str, base: &str) -> EngineResult<RolloverCheck> {
        let contracts = self.find_contracts(base).await?;
        Ok(check_rollover(symbol, &contracts, Utc::now()))
    }
}

// ---------------------------------------------------------------------------
// Gateway implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BrokerGateway for BrokerClient {
    #[instrument(skip(self, request), name = "broker::place_order", fields(symbol = %request.symbol))]
    async fn place_order(&self, request: &PlaceOrderRequest) -> EngineResult<PlaceOrderAck> {
        let mut body = json!({
            "accountId": self.account_id,
            "symbol": request.symbol,
            "action": request.action.to_string(),
            "orderType": request.order_type.to_string(),
            "orderQty": request.order_qty,
            "timeInForce": request.time_in_force,
            "isAutomated": true,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price);
        }
        if let Some(stop) = request.stop_price {
            body["stopPrice"] = json!(stop);
        }
        if let Some(tag) = &request.custom_tag_50 {
            body["customTag50"] = json!(tag);
        }

        let response = self
            .orders_breaker
            .execute(|| self.post_json("/order/placeorder", body.clone()))
            .await?;
        let ack = Self::parse_order_ack(&response)?;
        debug!(order_id = %ack.broker_order_id, status = %ack.status, "order placed");
        Ok(ack)
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, broker_order_id: &str) -> EngineResult<()> {
        self.orders_breaker
            .execute(|| self.post_json("/order/cancelorder", json!({ "orderId": broker_order_id })))
            .await?;
        debug!(broker_order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::modify_order")]
    async fn modify_order(
        &self,
        broker_order_id: &str,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> EngineResult<()> {
        let mut body = json!({ "orderId": broker_order_id });
        if let Some(price) = price {
            body["price"] = json!(price);
        }
        if let Some(stop) = stop_price {
            body["stopPrice"] = json!(stop);
        }
        self.orders_breaker
            .execute(|| self.post_json("/order/modifyorder", body.clone()))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::order_status")]
    async fn order_status(&self, broker_order_id: &str) -> EngineResult<BrokerOrderSnapshot> {
        let path = format!("/order/item?id={broker_order_id}");
        let body = self
            .orders_breaker
            .execute(|| self.get_json(&path))
            .await?;
        Ok(BrokerOrderSnapshot {
            status: Self::parse_order_status(&body["ordStatus"]),
            filled_qty: body["cumQty"].as_u64().unwrap_or(0) as u32,
            avg_fill_price: body["avgPx"].as_f64(),
        })
    }

    #[instrument(skip(self), name = "broker::list_positions")]
    async fn list_positions(&self) -> EngineResult<Vec<BrokerPosition>> {
        let body = self
            .orders_breaker
            .execute(|| self.get_json("/position/list"))
            .await?;
        let positions = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| {
                        Some(BrokerPosition {
                            symbol: p["symbol"].as_str()?.to_string(),
                            net_qty: p["netPos"].as_i64()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(positions)
    }

    async fn close_position(&self, symbol: &str) -> EngineResult<Option<String>> {
        let positions = self.list_positions().await?;
        let Some(position) = positions.iter().find(|p| p.symbol == symbol && p.net_qty != 0)
        else {
            warn!(symbol, "close requested but no open broker position");
            return Ok(None);
        };

        // Market order in the opposite direction for the full net quantity.
        let action = if position.net_qty > 0 {
            OrderAction::Sell
        } else {
            OrderAction::Buy
        };
        let ack = self
            .place_order(&PlaceOrderRequest {
                symbol: symbol.to_string(),
                action,
                order_type: crate::types::OrderType::Market,
                order_qty: position.net_qty.unsigned_abs() as u32,
                price: None,
                stop_price: None,
                time_in_force: crate::types::TimeInForce::Day,
                custom_tag_50: None,
            })
            .await?;
        info!(symbol, order_id = %ack.broker_order_id, "position flattened");
        Ok(Some(ack.broker_order_id))
    }

    #[instrument(skip(self), name = "broker::cash_balance")]
    async fn cash_balance(&self) -> EngineResult<f64> {
        let body = self
            .orders_breaker
            .execute(|| {
                self.post_json(
                    "/cashBalance/getCashBalanceSnapshot",
                    json!({ "accountId": self.account_id }),
                )
            })
            .await?;
        body["totalCashValue"]
            .as_f64()
            .or_else(|| body["cashBalance"].as_f64())
            .ok_or_else(|| {
                EngineError::broker("MalformedResponse", None, "cash balance missing amount")
            })
    }

    async fn resolve_symbol(
        &self,
        base: &str,
        check_positions: bool,
    ) -> EngineResult<ResolvedSymbol> {
        let contracts = self.find_contracts(base).await?;

        let open_symbol = if check_positions {
            self.list_positions()
                .await?
                .into_iter()
                .find(|p| p.net_qty != 0 && p.symbol.starts_with(base))
                .map(|p| p.symbol)
        } else {
            None
        };

        let now = Utc::now();
        let resolved = resolve_contract(base, &contracts, open_symbol.as_deref(), now)?;

        let check = check_rollover(&resolved.symbol, &contracts, now);
        let rollover_date = contracts
            .iter()
            .find(|c| c.symbol == resolved.symbol)
            .map(|c| c.expiry);
        if let Some(date) = rollover_date {
            debug!(
                base,
                symbol = %resolved.symbol,
                days = days_until_expiry(date, now),
                "symbol resolved"
            );
        }
        self.rollover
            .record(base, &resolved, check.next_symbol, rollover_date);
        Ok(resolved)
    }
}

#[async_trait]
impl BarSource for BrokerClient {
    /// GET /md/getchart — the most recent N bars, oldest first.
    async fn historical_bars(
        &self,
        symbol: &str,
        bar_count: u32,
        timeframe_minutes: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        let path = format!(
            "/md/getchart?symbol={symbol}&barCount={bar_count}&timeframe={timeframe_minutes}"
        );
        let body = self.md_breaker.execute(|| self.get_json(&path)).await?;
        let mut bars = Self::parse_bars(&body);
        bars.sort_by_key(|b| b.timestamp);
        debug!(symbol, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
