// =============================================================================
// Execution Engine — orchestrates strategies, market data, and order flow
// =============================================================================
//
// Lifecycle: stopped -> starting -> running -> stopping -> stopped, with
// `error` absorbing unrecoverable init failures.
//
// Every monitoring tick fans strategy checks out concurrently and waits for
// all of them to settle; a failing strategy is quarantined after three
// consecutive failures without affecting the others. Detected setups flow
// through a bounded FIFO queue (drop-newest backpressure) into a
// single-flight dispatcher that either alerts (copilot) or executes
// (autopilot).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerGateway;
use crate::circuit::{BreakerRegistry, BreakerSnapshot};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::instruments::Instrument;
use crate::market_data::{FeedState, MarketDataAggregator, MarketDataEvent, MarketDataFeed};
use crate::orders::{NewOrder, OrderManager};
use crate::persistence::{BehavioralRepository, StateType, StrategyRepository};
use crate::positions::PositionManager;
use crate::rules::{CompiledStrategy, EvaluationContext, IndicatorSnapshot};
use crate::setup::{setup_id, SetupDetection, SetupStatus, SignalType};
use crate::state_store::{StoredOpeningRange, StrategyStateStore};
use crate::types::{Direction, OrderAction, OrderType, StrategyConfig, TimeInForce};

/// Hard cap on queued setups; enqueues beyond it are dropped with a warning.
pub const SETUP_QUEUE_MAX_SIZE: usize = 10;
/// Consecutive check failures before a strategy is auto-paused.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Minimum closed candles before a strategy evaluates.
const MIN_CANDLES_FOR_EVALUATION: usize = 50;
/// Recent alerts retained for the status API.
const MAX_RECENT_ALERTS: usize = 100;
/// Recently resolved setups retained for the status API.
const MAX_RECENT_SETUPS: usize = 100;
/// Standard EMA periods always computed for the indicator snapshot.
const STANDARD_EMA_PERIODS: [u32; 3] = [20, 50, 200];

// ---------------------------------------------------------------------------
// Engine state & alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A recorded alert for the dashboard/API feed.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One queued setup with its enqueue time.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedSetup {
    pub setup: SetupDetection,
    pub added_at: DateTime<Utc>,
}

/// Serialisable status snapshot for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub strategy_count: usize,
    pub active_strategy_count: usize,
    pub queue_depth: usize,
    pub pending_approvals: usize,
    pub feed_state: Option<FeedState>,
    pub breakers: Vec<BreakerSnapshot>,
    pub recent_alerts: Vec<Alert>,
}

struct ActiveStrategy {
    config: StrategyConfig,
    compiled: CompiledStrategy,
    consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    strategies: RwLock<HashMap<String, ActiveStrategy>>,

    queue: Mutex<VecDeque<QueuedSetup>>,
    /// Single-flight guard for the queue dispatcher.
    processing_setup: AtomicBool,
    /// Copilot setups parked until an external approve/reject.
    pending_approval: RwLock<HashMap<String, SetupDetection>>,
    /// Recently resolved setups (executed / failed / rejected / alerted).
    recent_setups: RwLock<Vec<SetupDetection>>,

    aggregator: Arc<MarketDataAggregator>,
    feed: Option<Arc<MarketDataFeed>>,
    broker: Arc<dyn BrokerGateway>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionManager>,
    state_store: Arc<StrategyStateStore>,
    strategies_repo: Arc<dyn StrategyRepository>,
    behavioral: Arc<dyn BehavioralRepository>,
    breakers: Arc<BreakerRegistry>,

    alerts: RwLock<Vec<Alert>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        aggregator: Arc<MarketDataAggregator>,
        feed: Option<Arc<MarketDataFeed>>,
        broker: Arc<dyn BrokerGateway>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionManager>,
        state_store: Arc<StrategyStateStore>,
        strategies_repo: Arc<dyn StrategyRepository>,
        behavioral: Arc<dyn BehavioralRepository>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            config,
            state: RwLock::new(EngineState::Stopped),
            strategies: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            processing_setup: AtomicBool::new(false),
            pending_approval: RwLock::new(HashMap::new()),
            recent_setups: RwLock::new(Vec::new()),
            aggregator,
            feed,
            broker,
            orders,
            positions,
            state_store,
            strategies_repo,
            behavioral,
            breakers,
            alerts: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn set_state(&self, state: EngineState) {
        let mut current = self.state.write();
        if *current != state {
            info!(from = %current, to = %state, "engine state transition");
            *current = state;
        }
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Record an alert; the ring is capped at [`MAX_RECENT_ALERTS`].
    pub fn push_alert(&self, severity: AlertSeverity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            AlertSeverity::Info => info!(alert = %message, "alert"),
            AlertSeverity::Warning => warn!(alert = %message, "alert"),
            AlertSeverity::Critical => error!(alert = %message, "alert"),
        }
        let mut alerts = self.alerts.write();
        alerts.push(Alert {
            severity,
            message,
            at: Utc::now(),
        });
        while alerts.len() > MAX_RECENT_ALERTS {
            alerts.remove(0);
        }
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    /// Bring the engine up: load and compile strategies, restore persisted
    /// state, register market-data observers, and start the monitoring tick.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.state() != EngineState::Stopped {
            return Err(EngineError::Internal(format!(
                "engine cannot start from state {}",
                self.state()
            )));
        }
        self.set_state(EngineState::Starting);

        if let Err(e) = self.initialize().await {
            error!(error = %e, "engine initialisation failed");
            self.set_state(EngineState::Error);
            return Err(e);
        }

        // Market-data observers: candle close drives event-based
        // re-evaluation, "bars loaded" drives immediate catch-up, restore
        // triggers order reconciliation.
        let engine = self.clone();
        let mut events = self.aggregator.subscribe_events();
        let observer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MarketDataEvent::CandleClosed { symbol, .. })
                    | Ok(MarketDataEvent::HistoricalBarsLoaded { symbol, .. }) => {
                        engine.evaluate_symbol(&symbol).await;
                        engine.spawn_queue_dispatch();
                    }
                    Ok(MarketDataEvent::Restored) => {
                        info!("market data restored — reconciling orders");
                        if let Err(e) =
                            engine.orders.reconcile_orders(&engine.config.broker_account_id).await
                        {
                            warn!(error = %e, "post-restore reconciliation failed");
                        }
                    }
                    Ok(MarketDataEvent::ConnectionLost) => {
                        engine.push_alert(
                            AlertSeverity::Critical,
                            "market-data connection lost; reconnect attempts exhausted",
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "market-data event observer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Periodic monitoring tick.
        let engine = self.clone();
        let interval = std::time::Duration::from_secs(self.config.monitor_interval_secs);
        let tick = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                engine.monitoring_tick().await;
            }
        });

        self.tasks.lock().extend([observer, tick]);
        self.set_state(EngineState::Running);
        info!("execution engine running");
        Ok(())
    }

    async fn initialize(self: &Arc<Self>) -> EngineResult<()> {
        let configs = self
            .strategies_repo
            .list_active(&self.config.user_id, &self.config.broker_account_id)
            .await?;

        let mut strategies = HashMap::new();
        for config in configs {
            if let Err(e) = config.rules.validate() {
                warn!(strategy = %config.id, error = %e, "strategy has invalid rules — not loading");
                continue;
            }
            let compiled = CompiledStrategy::compile(config.rules.clone());
            let symbol = config.rules.instrument().symbol.as_str();
            self.aggregator.ensure_symbol(symbol);
            if let Some(feed) = &self.feed {
                feed.subscribe(symbol);
            }
            info!(strategy = %config.id, pattern = compiled.pattern(), symbol, "strategy loaded");
            strategies.insert(
                config.id.clone(),
                ActiveStrategy {
                    config,
                    compiled,
                    consecutive_failures: 0,
                },
            );
        }

        let ids: Vec<String> = strategies.keys().cloned().collect();
        info!(count = ids.len(), "strategies compiled");
        *self.strategies.write() = strategies;

        // Restore persisted intraday state (opening ranges feed the
        // aggregator cache directly).
        let restored = self.state_store.restore_all(&ids).await?;
        for (strategy_id, states) in restored {
            if let Some(payload) = states.get(&StateType::OpeningRange) {
                if let Ok(stored) = serde_json::from_value::<StoredOpeningRange>(payload.clone()) {
                    self.aggregator.set_opening_range(
                        &stored.symbol,
                        stored.start_minute,
                        stored.end_minute,
                        stored.range,
                    );
                    debug!(strategy = %strategy_id, "opening range restored");
                }
            }
        }

        self.state_store.cleanup_expired().await?;
        Ok(())
    }

    /// Shut down: cancel the tick and observers, disconnect market data,
    /// clear the queue.
    pub async fn stop(&self) {
        if self.state() != EngineState::Running {
            return;
        }
        self.set_state(EngineState::Stopping);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(feed) = &self.feed {
            feed.disconnect();
        }
        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            info!(dropped, "setup queue cleared on shutdown");
        }

        self.set_state(EngineState::Stopped);
        info!("execution engine stopped");
    }

    // -------------------------------------------------------------------------
    // Monitoring tick
    // -------------------------------------------------------------------------

    /// One 5-second tick: fan out strategy checks, kick the dispatcher,
    /// sweep safety limits.
    pub async fn monitoring_tick(self: &Arc<Self>) {
        let ids = self.active_strategy_ids();
        if !ids.is_empty() {
            // One task per strategy; a slow strategy cannot block the tick
            // barrier for longer than the slowest check, and one strategy's
            // panic or error never propagates to its peers.
            let mut checks: JoinSet<(String, EngineResult<()>)> = JoinSet::new();
            for id in ids {
                let engine = self.clone();
                checks.spawn(async move {
                    let result = engine.check_strategy(&id).await;
                    (id, result)
                });
            }

            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok((id, Ok(()))) => self.reset_strategy_failures(&id),
                    Ok((id, Err(e))) => {
                        warn!(strategy = %id, error = %e, "strategy check failed");
                        self.record_strategy_failure(&id).await;
                    }
                    Err(join_error) => {
                        // A panicked check counts as a failure but the
                        // strategy id is lost with the panic; log only.
                        error!(error = %join_error, "strategy check task panicked");
                    }
                }
            }
        }

        // Dispatcher runs in the background; the next tick may re-enter it,
        // which the single-flight flag absorbs.
        self.spawn_queue_dispatch();

        self.check_safety_limits().await;
    }

    fn active_strategy_ids(&self) -> Vec<String> {
        self.strategies
            .read()
            .values()
            .filter(|s| s.config.is_active)
            .map(|s| s.config.id.clone())
            .collect()
    }

    fn reset_strategy_failures(&self, strategy_id: &str) {
        if let Some(s) = self.strategies.write().get_mut(strategy_id) {
            s.consecutive_failures = 0;
        }
    }

    async fn record_strategy_failure(&self, strategy_id: &str) {
        let quarantined = {
            let mut strategies = self.strategies.write();
            match strategies.get_mut(strategy_id) {
                Some(s) => {
                    s.consecutive_failures += 1;
                    if s.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        s.config.is_active = false;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if quarantined {
            if let Err(e) = self.strategies_repo.set_active(strategy_id, false).await {
                warn!(strategy = strategy_id, error = %e, "failed to persist auto-pause");
            }
            self.push_alert(
                AlertSeverity::Critical,
                format!("strategy {strategy_id} auto-paused after {MAX_CONSECUTIVE_FAILURES} consecutive failures"),
            );
        }
    }

    /// Re-activate a quarantined strategy (external operator action).
    pub async fn resume_strategy(&self, strategy_id: &str) -> EngineResult<()> {
        let found = {
            let mut strategies = self.strategies.write();
            match strategies.get_mut(strategy_id) {
                Some(s) => {
                    s.consecutive_failures = 0;
                    s.config.is_active = true;
                    true
                }
                None => false,
            }
        };
        if !found {
            return Err(EngineError::Internal(format!(
                "strategy {strategy_id} not loaded"
            )));
        }
        self.strategies_repo.set_active(strategy_id, true).await?;
        self.push_alert(AlertSeverity::Info, format!("strategy {strategy_id} resumed"));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Strategy evaluation
    // -------------------------------------------------------------------------

    /// Event-driven path: evaluate every active strategy trading `symbol`.
    async fn evaluate_symbol(self: &Arc<Self>, symbol: &str) {
        let ids: Vec<String> = self
            .strategies
            .read()
            .values()
            .filter(|s| {
                s.config.is_active && s.config.rules.instrument().symbol.as_str() == symbol
            })
            .map(|s| s.config.id.clone())
            .collect();

        for id in ids {
            if let Err(e) = self.check_strategy(&id).await {
                warn!(strategy = %id, error = %e, "event-driven check failed");
                self.record_strategy_failure(&id).await;
            } else {
                self.reset_strategy_failures(&id);
            }
        }
    }

    /// Evaluate one strategy against current market data and enqueue a setup
    /// when its entry conditions fire.
    pub async fn check_strategy(self: &Arc<Self>, strategy_id: &str) -> EngineResult<()> {
        let (compiled, config) = {
            let strategies = self.strategies.read();
            let s = strategies
                .get(strategy_id)
                .ok_or_else(|| EngineError::Internal(format!("strategy {strategy_id} not loaded")))?;
            if !s.config.is_active {
                return Ok(());
            }
            (s.compiled.clone(), s.config.clone())
        };

        let symbol = config.rules.instrument().symbol.as_str();
        let now = Utc::now();

        let candles = self.aggregator.candles(symbol, 200);
        if candles.len() < MIN_CANDLES_FOR_EVALUATION {
            debug!(
                strategy = strategy_id,
                symbol,
                candles = candles.len(),
                "not enough candles yet — skipping"
            );
            return Ok(());
        }
        let Some(quote) = self.aggregator.latest_quote(symbol) else {
            debug!(strategy = strategy_id, symbol, "no quote yet — skipping");
            return Ok(());
        };

        // Opening range only when the compiled pattern needs it.
        let opening_range = compiled.opening_range_window().and_then(|(start, end)| {
            self.aggregator.opening_range(symbol, start, end, now)
        });

        // Indicator snapshot: the standard set plus any strategy-specific
        // periods.
        let mut indicators = IndicatorSnapshot::default();
        for period in STANDARD_EMA_PERIODS {
            if let Some(value) = self.aggregator.ema(symbol, period as usize) {
                indicators.set_ema(period, value);
            }
        }
        if let Some(period) = compiled.ema_period() {
            if let Some(value) = self.aggregator.ema(symbol, period as usize) {
                indicators.set_ema(period, value);
            }
        }
        if let Some(value) = self.aggregator.rsi(symbol, 14) {
            indicators.set_rsi(14, value);
        }
        if let Some(period) = compiled.rsi_period() {
            if let Some(value) = self.aggregator.rsi(symbol, period as usize) {
                indicators.set_rsi(period, value);
            }
        }
        indicators.atr14 = self.aggregator.atr(symbol, 14);
        indicators.vwap = self.aggregator.vwap(symbol);

        let ctx = EvaluationContext {
            candles: &candles,
            quote: &quote,
            indicators: &indicators,
            opening_range: opening_range.as_ref(),
            current_time: now,
        };

        let Some(signal) = compiled.should_enter(&ctx) else {
            return Ok(());
        };

        let entry = compiled.entry_price(&ctx);
        let stop = compiled.stop_price(signal.direction, entry, &ctx);
        let target = compiled.target_price(signal.direction, entry, stop, &ctx);
        let balance = self.broker.cash_balance().await?;
        let qty = compiled.contract_quantity(balance, entry, stop);

        let setup = SetupDetection {
            id: setup_id(strategy_id, now, signal.direction),
            strategy_id: strategy_id.to_string(),
            instrument: symbol.to_string(),
            signal_type: SignalType::Entry,
            direction: signal.direction,
            price: quote.last,
            timestamp: now,
            conditions_met: vec![signal.reason.clone()],
            indicators: indicators.to_map(),
            status: SetupStatus::Pending,
            order_id: None,
            error: None,
            entry_price: Some(entry),
            stop_price: Some(stop),
            target_price: Some(target),
            contract_quantity: Some(qty),
            confidence: Some(signal.confidence),
            reason: Some(signal.reason),
        };

        info!(
            strategy = strategy_id,
            setup = %setup.id,
            direction = %setup.direction,
            entry,
            stop,
            target,
            qty,
            "setup detected"
        );
        self.handle_setup_detected(setup, config.alerts_enabled).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Setup queue
    // -------------------------------------------------------------------------

    /// Enqueue a detected setup, deduplicating on id and dropping newest
    /// beyond the cap. Returns whether the setup entered the queue.
    pub async fn handle_setup_detected(&self, setup: SetupDetection, alert: bool) -> bool {
        let accepted = {
            let mut queue = self.queue.lock();
            if queue.iter().any(|q| q.setup.id == setup.id) {
                debug!(setup = %setup.id, "duplicate setup id in queue — dropped");
                false
            } else if queue.len() >= SETUP_QUEUE_MAX_SIZE {
                warn!(
                    setup = %setup.id,
                    depth = queue.len(),
                    "setup queue full — dropping newest (backpressure)"
                );
                false
            } else {
                queue.push_back(QueuedSetup {
                    setup: setup.clone(),
                    added_at: Utc::now(),
                });
                true
            }
        };

        if accepted {
            // Behavioural audit log is one-way; failure only logs.
            if let Ok(event) = serde_json::to_value(&setup) {
                if let Err(e) = self.behavioral.insert(event).await {
                    warn!(error = %e, "behavioral log insert failed");
                }
            }
            if alert {
                self.push_alert(
                    AlertSeverity::Info,
                    format!(
                        "setup {} detected: {} {} @ {:.2}",
                        setup.id, setup.direction, setup.instrument, setup.price
                    ),
                );
            }
        }
        accepted
    }

    fn spawn_queue_dispatch(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.process_setup_queue().await;
        });
    }

    /// Single-flight queue dispatcher: pops one setup and routes it by the
    /// owning strategy's autonomy level.
    pub async fn process_setup_queue(self: &Arc<Self>) {
        if self
            .processing_setup
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // another dispatch is in flight
        }

        let popped = self.queue.lock().pop_front();
        if let Some(queued) = popped {
            self.dispatch_setup(queued.setup).await;
        }

        self.processing_setup.store(false, Ordering::SeqCst);
    }

    async fn dispatch_setup(self: &Arc<Self>, mut setup: SetupDetection) {
        if !self.config.execution_enabled {
            setup.status = SetupStatus::Alerted;
            self.push_alert(
                AlertSeverity::Info,
                format!("setup {} alerted (execution disabled)", setup.id),
            );
            self.persist_setup(&setup).await;
            self.remember_setup(setup);
            return;
        }

        let autonomy = self
            .strategies
            .read()
            .get(&setup.strategy_id)
            .map(|s| s.config.autonomy_level)
            .unwrap_or_default();

        match autonomy {
            crate::types::AutonomyLevel::Copilot => {
                setup.status = SetupStatus::AwaitingApproval;
                self.persist_setup(&setup).await;
                self.push_alert(
                    AlertSeverity::Info,
                    format!("setup {} awaiting approval", setup.id),
                );
                self.pending_approval
                    .write()
                    .insert(setup.id.clone(), setup);
            }
            crate::types::AutonomyLevel::Autopilot => {
                let setup = self.execute_setup(setup).await;
                self.remember_setup(setup);
            }
        }
    }

    /// Place and submit the order for an approved/autopilot setup.
    async fn execute_setup(self: &Arc<Self>, mut setup: SetupDetection) -> SetupDetection {
        let qty = setup.contract_quantity.unwrap_or(1);
        let action = match setup.direction {
            Direction::Long => OrderAction::Buy,
            Direction::Short => OrderAction::Sell,
        };
        let (user_id, account_id) = {
            let strategies = self.strategies.read();
            match strategies.get(&setup.strategy_id) {
                Some(s) => (
                    s.config.user_id.clone(),
                    s.config.broker_account_id.clone(),
                ),
                None => (
                    self.config.user_id.clone(),
                    self.config.broker_account_id.clone(),
                ),
            }
        };

        let created = self
            .orders
            .create_order(NewOrder {
                user_id,
                strategy_id: Some(setup.strategy_id.clone()),
                broker_account_id: account_id,
                setup_id: Some(setup.id.clone()),
                symbol: setup.instrument.clone(),
                action,
                order_type: OrderType::Market,
                order_qty: qty,
                price: None,
                stop_price: None,
                time_in_force: TimeInForce::Day,
                parent_order_id: None,
                bracket_type: Some(crate::types::BracketType::Entry),
            })
            .await;

        let order = match created {
            Ok(order) => order,
            Err(e) => {
                setup.status = SetupStatus::Failed;
                setup.error = Some(e.to_string());
                self.push_alert(
                    AlertSeverity::Warning,
                    format!("setup {} failed: {e}", setup.id),
                );
                self.persist_setup(&setup).await;
                return setup;
            }
        };

        setup.order_id = Some(order.id.clone());
        match self.orders.submit_order(&order.id).await {
            Ok(submitted) => {
                setup.status = SetupStatus::Executed;
                info!(
                    setup = %setup.id,
                    order = %submitted.id,
                    status = %submitted.status,
                    "setup executed"
                );
            }
            Err(e) => {
                setup.status = SetupStatus::Failed;
                setup.error = Some(e.to_string());
                self.push_alert(
                    AlertSeverity::Warning,
                    format!("setup {} execution failed: {e}", setup.id),
                );
            }
        }
        self.persist_setup(&setup).await;
        setup
    }

    async fn persist_setup(&self, setup: &SetupDetection) {
        if let Ok(event) = serde_json::to_value(setup) {
            if let Err(e) = self.behavioral.insert(event).await {
                warn!(error = %e, "behavioral log insert failed");
            }
        }
    }

    fn remember_setup(&self, setup: SetupDetection) {
        let mut recent = self.recent_setups.write();
        recent.push(setup);
        while recent.len() > MAX_RECENT_SETUPS {
            recent.remove(0);
        }
    }

    // -------------------------------------------------------------------------
    // Copilot approval
    // -------------------------------------------------------------------------

    /// Approve a parked copilot setup and run the execute path.
    pub async fn approve_setup(self: &Arc<Self>, setup_id: &str) -> EngineResult<SetupDetection> {
        let Some(mut setup) = self.pending_approval.write().remove(setup_id) else {
            return Err(EngineError::Internal(format!(
                "setup {setup_id} is not awaiting approval"
            )));
        };
        setup.status = SetupStatus::Approved;
        let executed = self.execute_setup(setup).await;
        self.remember_setup(executed.clone());
        Ok(executed)
    }

    /// Reject a parked copilot setup.
    pub async fn reject_setup(
        self: &Arc<Self>,
        setup_id: &str,
        reason: Option<String>,
    ) -> EngineResult<SetupDetection> {
        let Some(mut setup) = self.pending_approval.write().remove(setup_id) else {
            return Err(EngineError::Internal(format!(
                "setup {setup_id} is not awaiting approval"
            )));
        };
        setup.status = SetupStatus::Rejected;
        setup.error = reason;
        self.persist_setup(&setup).await;
        self.remember_setup(setup.clone());
        Ok(setup)
    }

    // -------------------------------------------------------------------------
    // Safety sweep
    // -------------------------------------------------------------------------

    /// Pause any strategy whose daily loss cap is breached.
    async fn check_safety_limits(self: &Arc<Self>) {
        let capped: Vec<(String, f64)> = self
            .strategies
            .read()
            .values()
            .filter(|s| s.config.is_active)
            .filter_map(|s| s.config.max_daily_loss.map(|cap| (s.config.id.clone(), cap)))
            .collect();
        if capped.is_empty() {
            return;
        }

        let positions = match self
            .positions
            .open_positions(&self.config.broker_account_id)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "safety sweep could not load positions");
                return;
            }
        };

        for (strategy_id, cap) in capped {
            // Point PnL to dollars via the instrument point value.
            let pnl: f64 = positions
                .iter()
                .filter(|p| p.strategy_id.as_deref() == Some(strategy_id.as_str()))
                .map(|p| {
                    let point_value = Instrument::from_contract_symbol(&p.symbol)
                        .map(|i| i.point_value())
                        .unwrap_or(1.0);
                    (p.realized_pnl + p.unrealized_pnl) * point_value
                })
                .sum();

            if pnl <= -cap {
                if let Some(s) = self.strategies.write().get_mut(&strategy_id) {
                    s.config.is_active = false;
                }
                if let Err(e) = self.strategies_repo.set_active(&strategy_id, false).await {
                    warn!(strategy = %strategy_id, error = %e, "failed to persist loss pause");
                }
                self.push_alert(
                    AlertSeverity::Critical,
                    format!(
                        "strategy {strategy_id} paused: daily PnL {pnl:.2} breached -{cap:.2}"
                    ),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Queue contents plus copilot setups parked for approval.
    pub fn pending_setups(&self) -> Vec<SetupDetection> {
        let mut out: Vec<SetupDetection> =
            self.queue.lock().iter().map(|q| q.setup.clone()).collect();
        out.extend(self.pending_approval.read().values().cloned());
        out
    }

    pub fn recent_setups(&self) -> Vec<SetupDetection> {
        self.recent_setups.read().clone()
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    pub fn positions_manager(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    pub fn account_id(&self) -> &str {
        &self.config.broker_account_id
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let strategies = self.strategies.read();
        EngineSnapshot {
            state: self.state(),
            strategy_count: strategies.len(),
            active_strategy_count: strategies.values().filter(|s| s.config.is_active).count(),
            queue_depth: self.queue.lock().len(),
            pending_approvals: self.pending_approval.read().len(),
            feed_state: self.feed.as_ref().map(|f| f.state()),
            breakers: self.breakers.snapshots(),
            recent_alerts: self.alerts.read().iter().rev().take(10).cloned().collect(),
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("state", &self.state())
            .field("strategies", &self.strategies.read().len())
            .field("queue_depth", &self.queue.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerOrderSnapshot, BrokerPosition, PlaceOrderAck, PlaceOrderRequest, ResolvedSymbol,
        RolloverStatus,
    };
    use crate::instruments::Instrument;
    use crate::persistence::{MemoryStore, OrderRepository};
    use crate::rules::schema::*;
    use crate::types::{AutonomyLevel, OrderStatus};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    // -- broker stub ---------------------------------------------------------

    #[derive(Default)]
    struct StubBroker {
        place_calls: AtomicU32,
    }

    #[async_trait]
    impl BrokerGateway for StubBroker {
        async fn place_order(&self, _req: &PlaceOrderRequest) -> EngineResult<PlaceOrderAck> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlaceOrderAck {
                broker_order_id: "br-1".into(),
                status: OrderStatus::Filled,
                filled_qty: 1,
                avg_fill_price: Some(5001.0),
            })
        }
        async fn cancel_order(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn modify_order(
            &self,
            _id: &str,
            _price: Option<f64>,
            _stop: Option<f64>,
        ) -> EngineResult<()> {
            Ok(())
        }
        async fn order_status(&self, _id: &str) -> EngineResult<BrokerOrderSnapshot> {
            Ok(BrokerOrderSnapshot {
                status: OrderStatus::Filled,
                filled_qty: 1,
                avg_fill_price: Some(5001.0),
            })
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

    // -- fixtures ------------------------------------------------------------

    fn engine_config(execution_enabled: bool) -> EngineConfig {
        EngineConfig {
            account_type: Default::default(),
            api_base_live: "https://live.test".into(),
            api_base_demo: "https://demo.test".into(),
            md_ws_live: "wss://live.test".into(),
            md_ws_demo: "wss://demo.test".into(),
            database_url: "mem://".into(),
            database_key: "key".into(),
            user_id: "user-1".into(),
            broker_account_id: "acct-1".into(),
            execution_enabled,
            alerts_enabled: true,
            monitor_interval_secs: 5,
        }
    }

    fn breakout_strategy(id: &str, autonomy: AutonomyLevel) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            user_id: "user-1".into(),
            broker_account_id: "acct-1".into(),
            name: format!("breakout {id}"),
            rules: CanonicalRules::Breakout {
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
                        value: 20.0,
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
            },
            autonomy_level: autonomy,
            is_active: true,
            max_daily_loss: None,
            alerts_enabled: false,
        }
    }

    struct Harness {
        engine: Arc<ExecutionEngine>,
        store: Arc<MemoryStore>,
        broker: Arc<StubBroker>,
        aggregator: Arc<MarketDataAggregator>,
    }

    fn build(execution_enabled: bool, strategies: Vec<StrategyConfig>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for s in strategies {
            store.seed_strategy(s);
        }
        let broker: Arc<StubBroker> = Arc::new(StubBroker::default());
        let aggregator = Arc::new(MarketDataAggregator::new());
        let breakers = Arc::new(BreakerRegistry::new());
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            broker.clone(),
        ));
        let positions = Arc::new(PositionManager::new(store.clone()));
        let state_store = Arc::new(StrategyStateStore::new(store.clone()));

        let engine = Arc::new(ExecutionEngine::new(
            engine_config(execution_enabled),
            aggregator.clone(),
            None,
            broker.clone(),
            orders,
            positions,
            state_store,
            store.clone(),
            store.clone(),
            breakers,
        ));
        Harness {
            engine,
            store,
            broker,
            aggregator,
        }
    }

    fn sample_setup(id: &str, strategy_id: &str) -> SetupDetection {
        SetupDetection {
            id: id.to_string(),
            strategy_id: strategy_id.to_string(),
            instrument: "ES".into(),
            signal_type: SignalType::Entry,
            direction: Direction::Long,
            price: 5001.0,
            timestamp: Utc::now(),
            conditions_met: vec!["test".into()],
            indicators: Default::default(),
            status: SetupStatus::Pending,
            order_id: None,
            error: None,
            entry_price: Some(5001.0),
            stop_price: Some(4996.0),
            target_price: Some(5011.0),
            contract_quantity: Some(1),
            confidence: Some(0.7),
            reason: Some("test".into()),
        }
    }

    async fn start(harness: &Harness) {
        harness.engine.start().await.unwrap();
        assert_eq!(harness.engine.state(), EngineState::Running);
    }

    /// Seed the aggregator with 60 closed ES candles and a quote above the
    /// 20-bar high so the breakout strategy fires.
    fn seed_breakout_market(aggregator: &MarketDataAggregator) {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        for i in 0..61i64 {
            let ts = start + chrono::Duration::seconds(i * 300);
            let price = 5000.0 + (i % 5) as f64 * 0.25;
            aggregator.on_trade("ES", price, 10.0, ts);
        }
        aggregator.on_quote(crate::types::Quote {
            symbol: "ES".into(),
            bid: 5005.0,
            ask: 5005.5,
            last: 5005.25, // above every candle high
            volume: 100.0,
            timestamp: start + chrono::Duration::seconds(61 * 300),
        });
    }

    // -- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn start_loads_and_compiles_strategies() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        start(&harness).await;
        let snapshot = harness.engine.snapshot();
        assert_eq!(snapshot.strategy_count, 1);
        assert_eq!(snapshot.active_strategy_count, 1);
        harness.engine.stop().await;
        assert_eq!(harness.engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn start_skips_strategies_with_invalid_rules() {
        let mut bad = breakout_strategy("s-bad", AutonomyLevel::Autopilot);
        if let CanonicalRules::Breakout { risk, .. } = &mut bad.rules {
            risk.risk_percent = 50.0; // out of range
        }
        let harness = build(true, vec![bad, breakout_strategy("s-ok", AutonomyLevel::Autopilot)]);
        start(&harness).await;
        assert_eq!(harness.engine.snapshot().strategy_count, 1);
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn queue_caps_at_ten_and_dedupes() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);

        // Duplicate id is dropped.
        assert!(harness.engine.handle_setup_detected(sample_setup("dup", "s-1"), false).await);
        assert!(!harness.engine.handle_setup_detected(sample_setup("dup", "s-1"), false).await);

        // Fill to the cap; the 11th drops without side effects.
        for i in 0..12 {
            harness
                .engine
                .handle_setup_detected(sample_setup(&format!("s-{i}"), "s-1"), false)
                .await;
        }
        assert_eq!(harness.engine.pending_setups().len(), SETUP_QUEUE_MAX_SIZE);
    }

    #[tokio::test]
    async fn quarantine_after_three_consecutive_failures() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        start(&harness).await;

        for _ in 0..2 {
            harness.engine.record_strategy_failure("s-1").await;
        }
        assert_eq!(harness.engine.active_strategy_ids(), vec!["s-1".to_string()]);

        harness.engine.record_strategy_failure("s-1").await;
        assert!(harness.engine.active_strategy_ids().is_empty());

        // The pause persisted, and check_strategy now no-ops.
        assert!(harness
            .store
            .list_active("user-1", "acct-1")
            .await
            .unwrap()
            .is_empty());
        harness.engine.check_strategy("s-1").await.unwrap();

        // A success resets the counter path after resume.
        harness.engine.resume_strategy("s-1").await.unwrap();
        assert_eq!(harness.engine.active_strategy_ids().len(), 1);
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn failure_counter_resets_on_success() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        start(&harness).await;

        harness.engine.record_strategy_failure("s-1").await;
        harness.engine.record_strategy_failure("s-1").await;
        harness.engine.reset_strategy_failures("s-1");
        harness.engine.record_strategy_failure("s-1").await;
        // Two more needed again; strategy still active.
        assert_eq!(harness.engine.active_strategy_ids().len(), 1);
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn autopilot_dispatch_executes_setup() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        start(&harness).await;

        harness
            .engine
            .handle_setup_detected(sample_setup("setup-a", "s-1"), false)
            .await;
        harness.engine.process_setup_queue().await;

        assert_eq!(harness.broker.place_calls.load(Ordering::SeqCst), 1);
        let recent = harness.engine.recent_setups();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, SetupStatus::Executed);
        assert!(recent[0].order_id.is_some());

        // The order row carries the setup id end to end.
        let order = harness
            .store
            .find_by_setup_id("setup-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.symbol, "ESH6");
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn copilot_dispatch_waits_for_approval() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Copilot)]);
        start(&harness).await;

        harness
            .engine
            .handle_setup_detected(sample_setup("setup-c", "s-1"), false)
            .await;
        harness.engine.process_setup_queue().await;

        // Parked, not executed.
        assert_eq!(harness.broker.place_calls.load(Ordering::SeqCst), 0);
        let pending = harness.engine.pending_setups();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, SetupStatus::AwaitingApproval);

        // Approval runs the execute path.
        let executed = harness.engine.approve_setup("setup-c").await.unwrap();
        assert_eq!(executed.status, SetupStatus::Executed);
        assert_eq!(harness.broker.place_calls.load(Ordering::SeqCst), 1);
        assert!(harness.engine.pending_setups().is_empty());
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn reject_marks_setup_rejected() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Copilot)]);
        start(&harness).await;

        harness
            .engine
            .handle_setup_detected(sample_setup("setup-r", "s-1"), false)
            .await;
        harness.engine.process_setup_queue().await;

        let rejected = harness
            .engine
            .reject_setup("setup-r", Some("too choppy".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, SetupStatus::Rejected);
        assert_eq!(rejected.error.as_deref(), Some("too choppy"));
        assert_eq!(harness.broker.place_calls.load(Ordering::SeqCst), 0);

        // Unknown ids error.
        assert!(harness.engine.approve_setup("setup-r").await.is_err());
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn execution_disabled_marks_alerted() {
        let harness = build(false, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        start(&harness).await;

        harness
            .engine
            .handle_setup_detected(sample_setup("setup-d", "s-1"), false)
            .await;
        harness.engine.process_setup_queue().await;

        assert_eq!(harness.broker.place_calls.load(Ordering::SeqCst), 0);
        let recent = harness.engine.recent_setups();
        assert_eq!(recent[0].status, SetupStatus::Alerted);
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn check_strategy_detects_breakout_and_enqueues() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        // Bare initialize: no observer/tick tasks competing for the queue.
        harness.engine.initialize().await.unwrap();
        seed_breakout_market(&harness.aggregator);

        harness.engine.check_strategy("s-1").await.unwrap();

        let pending = harness.engine.pending_setups();
        assert_eq!(pending.len(), 1);
        let setup = &pending[0];
        assert_eq!(setup.direction, Direction::Long);
        assert_eq!(setup.entry_price, Some(5005.25));
        // 20 ticks * 0.25 below entry.
        assert_eq!(setup.stop_price, Some(5000.25));
        // 2R above entry.
        assert_eq!(setup.target_price, Some(5015.25));
        assert!(setup.contract_quantity.unwrap() >= 1);
        assert_eq!(setup.status, SetupStatus::Pending);

        // Audit row was written on enqueue.
        assert!(!harness.store.behavioral_events().is_empty());
    }

    #[tokio::test]
    async fn check_strategy_skips_below_candle_minimum() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        harness.engine.initialize().await.unwrap();

        // Only 10 candles: evaluation skips without error.
        let start_ts = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        for i in 0..11i64 {
            harness.aggregator.on_trade(
                "ES",
                5000.0,
                1.0,
                start_ts + chrono::Duration::seconds(i * 300),
            );
        }
        harness.engine.check_strategy("s-1").await.unwrap();
        assert!(harness.engine.pending_setups().is_empty());
    }

    #[tokio::test]
    async fn safety_sweep_pauses_strategy_on_daily_loss() {
        let mut strategy = breakout_strategy("s-1", AutonomyLevel::Autopilot);
        strategy.max_daily_loss = Some(500.0);
        let harness = build(true, vec![strategy]);
        start(&harness).await;

        // Open a losing ES position for the strategy: -11 points on 1
        // contract = -$550 at $50/point.
        let order = crate::types::Order {
            id: "o-1".into(),
            user_id: "user-1".into(),
            strategy_id: Some("s-1".into()),
            broker_account_id: "acct-1".into(),
            setup_id: None,
            broker_order_id: Some("b-1".into()),
            symbol: "ESH6".into(),
            action: OrderAction::Buy,
            order_type: OrderType::Market,
            order_qty: 1,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            filled_qty: 1,
            avg_fill_price: Some(5000.0),
            status: OrderStatus::Filled,
            reject_reason: None,
            parent_order_id: None,
            bracket_type: None,
            created_at: Utc::now(),
            submitted_at: Some(Utc::now()),
            filled_at: Some(Utc::now()),
            updated_at: Utc::now(),
            submit_latency_ms: None,
        };
        let position = harness
            .engine
            .positions_manager()
            .open_position(&order, None, None)
            .await
            .unwrap();
        harness
            .engine
            .positions_manager()
            .update_position_pnl(&position.id, 4989.0)
            .await
            .unwrap();

        harness.engine.check_safety_limits().await;
        assert!(harness.engine.active_strategy_ids().is_empty());
        harness.engine.stop().await;
    }

    #[tokio::test]
    async fn monitoring_tick_runs_all_phases() {
        let harness = build(true, vec![breakout_strategy("s-1", AutonomyLevel::Autopilot)]);
        harness.engine.initialize().await.unwrap();
        seed_breakout_market(&harness.aggregator);

        harness.engine.monitoring_tick().await;

        // The tick's strategy check found the breakout; the spawned
        // dispatcher may or may not have drained it yet.
        assert!(!harness.engine.pending_setups().is_empty()
            || !harness.engine.recent_setups().is_empty());
    }
}
