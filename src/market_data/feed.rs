// =============================================================================
// Market-Data Feed — reconnecting WebSocket client
// =============================================================================
//
// Maintains a single wire connection to the broker market-data endpoint.
// Frames are newline-delimited JSON with the verbs `authorize`,
// `md/subscribeQuote`, `md/subscribeTrade`, `md/unsubscribeQuote` and
// `ping`/`pong`; inbound events carry one of `quote`, `trade`, `chart`.
//
// On disconnect the feed reconnects with exponential backoff
// (min(base * 2^(attempt-1), max)); once attempts are exhausted it transitions
// to `failed` and publishes a connection-lost notice. After a successful
// reconnect each subscribed symbol is backfilled with up to 200 historical
// bars and a "restored" event fires.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::market_data::aggregator::{MarketDataAggregator, MarketDataEvent};
use crate::market_data::BarSource;
use crate::types::{Ohlcv, Quote};

/// Bars requested per symbol on backfill.
const BACKFILL_BAR_COUNT: u32 = 200;
/// Timeframe of the candle buffer, in minutes.
const BACKFILL_TIMEFRAME_MINUTES: u32 = 5;
/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub access_token: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl FeedConfig {
    pub fn new(ws_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            access_token: access_token.into(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff: `min(base * 2^(attempt-1), max)`.
pub fn reconnect_delay(config: &FeedConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = config.base_delay.saturating_mul(1u32 << exp);
    delay.min(config.max_delay)
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

pub(crate) fn authorize_frame(token: &str) -> String {
    json!({ "op": "authorize", "token": token }).to_string()
}

pub(crate) fn subscribe_quote_frame(symbol: &str) -> String {
    json!({ "op": "md/subscribeQuote", "symbol": symbol }).to_string()
}

pub(crate) fn subscribe_trade_frame(symbol: &str) -> String {
    json!({ "op": "md/subscribeTrade", "symbol": symbol }).to_string()
}

pub(crate) fn unsubscribe_quote_frame(symbol: &str) -> String {
    json!({ "op": "md/unsubscribeQuote", "symbol": symbol }).to_string()
}

pub(crate) fn ping_frame() -> String {
    json!({ "op": "ping" }).to_string()
}

// ---------------------------------------------------------------------------
// Inbound frame handling
// ---------------------------------------------------------------------------

/// What a single inbound frame meant, for the read loop's control flow.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Authorized,
    MarketData,
    Pong,
    Ignored,
}

fn parse_ms_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let ms = value.as_i64()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// Parse one newline-delimited JSON frame and route its payload into the
/// aggregator. Malformed frames are logged and skipped, never fatal.
pub(crate) fn handle_frame(aggregator: &MarketDataAggregator, text: &str) -> FrameOutcome {
    let mut outcome = FrameOutcome::Ignored;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse market-data frame");
                continue;
            }
        };

        match value["e"].as_str() {
            Some("authorized") => outcome = FrameOutcome::Authorized,
            Some("pong") => outcome = FrameOutcome::Pong,
            Some("trade") => {
                let symbol = value["symbol"].as_str().unwrap_or_default();
                let price = value["price"].as_f64().unwrap_or(f64::NAN);
                let size = value["size"].as_f64().unwrap_or(0.0);
                match parse_ms_timestamp(&value["timestamp"]) {
                    Some(ts) => {
                        aggregator.on_trade(symbol, price, size, ts);
                        outcome = FrameOutcome::MarketData;
                    }
                    None => warn!(symbol, "trade frame without valid timestamp"),
                }
            }
            Some("quote") => {
                let symbol = value["symbol"].as_str().unwrap_or_default().to_string();
                let timestamp = parse_ms_timestamp(&value["timestamp"]).unwrap_or_else(Utc::now);
                aggregator.on_quote(Quote {
                    symbol,
                    bid: value["bid"].as_f64().unwrap_or(0.0),
                    ask: value["ask"].as_f64().unwrap_or(0.0),
                    last: value["last"].as_f64().unwrap_or(0.0),
                    volume: value["volume"].as_f64().unwrap_or(0.0),
                    timestamp,
                });
                outcome = FrameOutcome::MarketData;
            }
            Some("chart") => {
                // Chart events carry a batch of bars for one symbol.
                let symbol = value["symbol"].as_str().unwrap_or_default().to_string();
                let bars: Vec<Ohlcv> = value["bars"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|b| {
                                Some(Ohlcv {
                                    timestamp: parse_ms_timestamp(&b["timestamp"])?,
                                    open: b["open"].as_f64()?,
                                    high: b["high"].as_f64()?,
                                    low: b["low"].as_f64()?,
                                    close: b["close"].as_f64()?,
                                    volume: b["volume"].as_f64().unwrap_or(0.0),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if !symbol.is_empty() && !bars.is_empty() {
                    aggregator.merge_historical(&symbol, bars);
                    outcome = FrameOutcome::MarketData;
                }
            }
            _ => debug!(frame = line, "ignoring unrecognised frame"),
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

pub struct MarketDataFeed {
    config: FeedConfig,
    aggregator: Arc<MarketDataAggregator>,
    bars: Arc<dyn BarSource>,
    breaker: Arc<CircuitBreaker>,
    state: RwLock<FeedState>,
    subscriptions: RwLock<HashSet<String>>,
    reconnect_attempts: AtomicU32,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: watch::Sender<bool>,
}

impl MarketDataFeed {
    pub fn new(
        config: FeedConfig,
        aggregator: Arc<MarketDataAggregator>,
        bars: Arc<dyn BarSource>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            aggregator,
            bars,
            breaker,
            state: RwLock::new(FeedState::Disconnected),
            subscriptions: RwLock::new(HashSet::new()),
            reconnect_attempts: AtomicU32::new(0),
            outbound,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            shutdown,
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    fn set_state(&self, state: FeedState) {
        let mut current = self.state.write();
        if *current != state {
            info!(from = %current, to = %state, "feed state transition");
            *current = state;
        }
    }

    /// Stop the feed; the run loop drains and exits.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        self.set_state(FeedState::Disconnected);
    }

    /// Add a symbol to the subscription set.
    ///
    /// When connected, subscribe frames go out immediately; otherwise the
    /// wire subscription is deferred until (re)connect. An initial
    /// subscription kicks off a non-blocking historical backfill whose
    /// completion event drives immediate re-evaluation in the engine.
    pub fn subscribe(self: &Arc<Self>, symbol: &str) {
        let is_new = self.subscriptions.write().insert(symbol.to_string());
        self.aggregator.ensure_symbol(symbol);

        if self.state() == FeedState::Connected {
            let _ = self.outbound.send(subscribe_quote_frame(symbol));
            let _ = self.outbound.send(subscribe_trade_frame(symbol));
        }

        if is_new {
            let feed = self.clone();
            let symbol = symbol.to_string();
            tokio::spawn(async move {
                feed.backfill_symbol(&symbol).await;
            });
        }
    }

    /// Remove a symbol and, when connected, unsubscribe on the wire.
    pub fn unsubscribe(&self, symbol: &str) {
        self.subscriptions.write().remove(symbol);
        if self.state() == FeedState::Connected {
            let _ = self.outbound.send(unsubscribe_quote_frame(symbol));
        }
    }

    async fn backfill_symbol(&self, symbol: &str) {
        let result = self
            .breaker
            .execute(|| {
                self.bars
                    .historical_bars(symbol, BACKFILL_BAR_COUNT, BACKFILL_TIMEFRAME_MINUTES)
            })
            .await;
        match result {
            Ok(bars) => {
                // merge_historical publishes the "bars loaded" event itself.
                self.aggregator.merge_historical(symbol, bars);
            }
            Err(e) => warn!(symbol, error = %e, "historical backfill failed"),
        }
    }

    /// Run the connection loop until shutdown or attempts are exhausted.
    ///
    /// The usual shape in `main`:
    /// ```ignore
    /// let feed = Arc::new(MarketDataFeed::new(...));
    /// tokio::spawn({ let feed = feed.clone(); async move { feed.run().await } });
    /// ```
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .context("feed run loop started twice")?;

        loop {
            if *shutdown.borrow() {
                self.set_state(FeedState::Disconnected);
                return Ok(());
            }

            let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
            self.set_state(if attempt == 0 {
                FeedState::Connecting
            } else {
                FeedState::Reconnecting
            });

            match self.connect_once(&mut shutdown, &mut outbound_rx).await {
                Ok(true) => {
                    // Clean shutdown requested.
                    self.set_state(FeedState::Disconnected);
                    return Ok(());
                }
                Ok(false) | Err(_) => {
                    let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > self.config.max_reconnect_attempts {
                        error!(attempts = attempt - 1, "reconnect attempts exhausted");
                        self.set_state(FeedState::Failed);
                        self.aggregator.publish(MarketDataEvent::ConnectionLost);
                        return Ok(());
                    }
                    let delay = reconnect_delay(&self.config, attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "feed reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One connection lifetime. Returns `Ok(true)` on requested shutdown,
    /// `Ok(false)` when the socket dropped and a reconnect should follow.
    async fn connect_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<bool> {
        info!(url = %self.config.ws_url, "connecting to market-data socket");

        let (ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(&self.config.ws_url),
        )
        .await
        .context("market-data connect timed out")?
        .context("market-data connect failed")?;

        let (mut write, mut read) = ws.split();

        // Authorize before anything else.
        write
            .send(Message::Text(authorize_frame(&self.config.access_token)))
            .await
            .context("failed to send authorize frame")?;

        let was_reconnect = self.reconnect_attempts.load(Ordering::SeqCst) > 0;
        let mut authorized = false;
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(true);
                }
                _ = ping_timer.tick() => {
                    if authorized {
                        if let Err(e) = write.send(Message::Text(ping_frame())).await {
                            warn!(error = %e, "keep-alive ping failed");
                            return Ok(false);
                        }
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        warn!(error = %e, "outbound frame failed");
                        return Ok(false);
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match handle_frame(&self.aggregator, &text) {
                                FrameOutcome::Authorized if !authorized => {
                                    authorized = true;
                                    self.on_authorized(&mut write, was_reconnect).await?;
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("market-data socket closed");
                            return Ok(false);
                        }
                        Some(Ok(_)) => {} // binary / pong frames ignored
                        Some(Err(e)) => {
                            error!(error = %e, "market-data read error");
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    /// Post-authorization work: resubscribe, then backfill on reconnect.
    async fn on_authorized<S>(&self, write: &mut S, was_reconnect: bool) -> Result<()>
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        self.set_state(FeedState::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        info!("market-data feed authorized");

        let symbols: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        for symbol in &symbols {
            write
                .send(Message::Text(subscribe_quote_frame(symbol)))
                .await
                .context("resubscribe quote failed")?;
            write
                .send(Message::Text(subscribe_trade_frame(symbol)))
                .await
                .context("resubscribe trade failed")?;
        }

        if was_reconnect {
            // Backfill what we missed while disconnected, then tell the
            // engine state is restored.
            for symbol in symbols {
                self.backfill_symbol(&symbol).await;
            }
            self.aggregator.publish(MarketDataEvent::Restored);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MarketDataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFeed")
            .field("state", &*self.state.read())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FeedConfig {
        FeedConfig::new("wss://md.example.test/ws", "token-1")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = config();
        assert_eq!(reconnect_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(&cfg, 3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(&cfg, 5), Duration::from_secs(16));
        // Capped at max_delay.
        assert_eq!(reconnect_delay(&cfg, 7), Duration::from_secs(30));
        assert_eq!(reconnect_delay(&cfg, 30), Duration::from_secs(30));
    }

    #[test]
    fn outbound_frames_carry_expected_verbs() {
        assert_eq!(
            authorize_frame("tok"),
            r#"{"op":"authorize","token":"tok"}"#
        );
        let frame: serde_json::Value =
            serde_json::from_str(&subscribe_quote_frame("ESH6")).unwrap();
        assert_eq!(frame["op"], "md/subscribeQuote");
        assert_eq!(frame["symbol"], "ESH6");
        let frame: serde_json::Value =
            serde_json::from_str(&subscribe_trade_frame("ESH6")).unwrap();
        assert_eq!(frame["op"], "md/subscribeTrade");
        let frame: serde_json::Value =
            serde_json::from_str(&unsubscribe_quote_frame("ESH6")).unwrap();
        assert_eq!(frame["op"], "md/unsubscribeQuote");
        let frame: serde_json::Value = serde_json::from_str(&ping_frame()).unwrap();
        assert_eq!(frame["op"], "ping");
    }

    #[test]
    fn trade_frame_feeds_the_aggregator() {
        let agg = MarketDataAggregator::new();
        let frame = r#"{"e":"trade","symbol":"ESH6","price":5000.25,"size":3,"timestamp":1736951400000}"#;
        assert_eq!(handle_frame(&agg, frame), FrameOutcome::MarketData);
        let current = agg.current_candle("ESH6").unwrap();
        assert_eq!(current.close, 5000.25);
        assert_eq!(current.volume, 3.0);
    }

    #[test]
    fn quote_frame_updates_cache() {
        let agg = MarketDataAggregator::new();
        let frame = r#"{"e":"quote","symbol":"ESH6","bid":4999.75,"ask":5000.25,"last":5000.0,"volume":12,"timestamp":1736951400000}"#;
        assert_eq!(handle_frame(&agg, frame), FrameOutcome::MarketData);
        let q = agg.latest_quote("ESH6").unwrap();
        assert_eq!(q.bid, 4999.75);
        assert_eq!(q.last, 5000.0);
    }

    #[test]
    fn newline_delimited_frames_all_processed() {
        let agg = MarketDataAggregator::new();
        let frames = concat!(
            r#"{"e":"trade","symbol":"ESH6","price":5000.0,"size":1,"timestamp":1736951400000}"#,
            "\n",
            r#"{"e":"trade","symbol":"ESH6","price":5001.0,"size":1,"timestamp":1736951410000}"#,
            "\n",
        );
        handle_frame(&agg, frames);
        let current = agg.current_candle("ESH6").unwrap();
        assert_eq!(current.high, 5001.0);
        assert_eq!(current.volume, 2.0);
    }

    #[test]
    fn authorized_and_pong_frames_recognised() {
        let agg = MarketDataAggregator::new();
        assert_eq!(
            handle_frame(&agg, r#"{"e":"authorized"}"#),
            FrameOutcome::Authorized
        );
        assert_eq!(handle_frame(&agg, r#"{"e":"pong"}"#), FrameOutcome::Pong);
    }

    #[test]
    fn malformed_frames_are_skipped_not_fatal() {
        let agg = MarketDataAggregator::new();
        assert_eq!(handle_frame(&agg, "not json"), FrameOutcome::Ignored);
        assert_eq!(
            handle_frame(&agg, r#"{"e":"trade","symbol":"ESH6","price":5000.0}"#),
            FrameOutcome::Ignored // no timestamp
        );
        assert_eq!(agg.candle_count("ESH6"), 0);
    }

    #[test]
    fn chart_frame_merges_bars() {
        let agg = MarketDataAggregator::new();
        let frame = r#"{"e":"chart","symbol":"ESH6","bars":[
            {"timestamp":1736950800000,"open":4990.0,"high":4995.0,"low":4988.0,"close":4992.0,"volume":100},
            {"timestamp":1736951100000,"open":4992.0,"high":4999.0,"low":4991.0,"close":4998.0,"volume":150}
        ]}"#;
        assert_eq!(handle_frame(&agg, frame), FrameOutcome::MarketData);
        assert_eq!(agg.candle_count("ESH6"), 2);
    }
}
