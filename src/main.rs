// =============================================================================
// Meridian Futures Engine — Main Entry Point
// =============================================================================
//
// The engine starts with execution disabled unless EXECUTION_ENABLED is set:
// every detected setup is alerted instead of routed to the broker until the
// operator opts in.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod circuit;
mod config;
mod engine;
mod errors;
mod indicators;
mod instruments;
mod market_data;
mod orders;
mod persistence;
mod positions;
mod rules;
mod safety;
mod setup;
mod state_store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::client::BrokerClient;
use crate::broker::BrokerGateway;
use crate::circuit::{BreakerRegistry, BREAKER_MARKET_DATA};
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::market_data::{BarSource, FeedConfig, MarketDataAggregator, MarketDataFeed};
use crate::orders::OrderManager;
use crate::persistence::MemoryStore;
use crate::positions::PositionManager;
use crate::state_store::StrategyStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Futures Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env().context("engine configuration is incomplete")?;
    let access_token = std::env::var("BROKER_ACCESS_TOKEN")
        .context("missing required environment variable BROKER_ACCESS_TOKEN")?;

    info!(
        account_type = %config.account_type,
        execution_enabled = config.execution_enabled,
        api_base = config.api_base(),
        "engine configured"
    );

    // ── 2. Fault-tolerance & broker client ───────────────────────────────
    let breakers = Arc::new(BreakerRegistry::new());

    let broker = Arc::new(BrokerClient::new(
        config.api_base(),
        &config.broker_account_id,
        access_token,
        Utc::now() + ChronoDuration::hours(1),
        &breakers,
    ));
    let _token_refresh = broker.spawn_token_refresh();

    // ── 3. Persistence ───────────────────────────────────────────────────
    // The in-memory store backs demo mode; a relational implementation of
    // the same repository traits plugs in here for production.
    let store = Arc::new(MemoryStore::new());

    // ── 4. Market data ───────────────────────────────────────────────────
    let aggregator = Arc::new(MarketDataAggregator::new());
    let md_breaker = breakers
        .get(BREAKER_MARKET_DATA)
        .expect("market-data breaker registered at startup");
    let bar_source: Arc<dyn BarSource> = broker.clone();
    let feed = Arc::new(MarketDataFeed::new(
        FeedConfig::new(config.md_ws_url(), broker.access_token()),
        aggregator.clone(),
        bar_source,
        md_breaker,
    ));
    {
        let feed = feed.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.run().await {
                error!(error = %e, "market-data feed terminated");
            }
        });
    }

    // ── 5. Managers ──────────────────────────────────────────────────────
    let gateway: Arc<dyn BrokerGateway> = broker.clone();
    let orders = Arc::new(OrderManager::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        gateway.clone(),
    ));
    let positions = Arc::new(PositionManager::new(store.clone()));
    let state_store = Arc::new(StrategyStateStore::new(store.clone()));

    // ── 6. Execution engine ──────────────────────────────────────────────
    let engine = Arc::new(ExecutionEngine::new(
        config.clone(),
        aggregator.clone(),
        Some(feed.clone()),
        gateway,
        orders,
        positions.clone(),
        state_store,
        store.clone(),
        store.clone(),
        breakers,
    ));

    if let Err(e) = engine.start().await {
        error!(error = %e, "engine failed to start");
        anyhow::bail!("engine failed to start: {e}");
    }

    // ── 7. Position mark-to-market loop ──────────────────────────────────
    {
        let positions = positions.clone();
        let aggregator = aggregator.clone();
        let account_id = config.broker_account_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let open = match positions.open_positions(&account_id).await {
                    Ok(open) => open,
                    Err(e) => {
                        warn!(error = %e, "mark-to-market could not load positions");
                        continue;
                    }
                };
                for position in &open {
                    let base = crate::instruments::Instrument::from_contract_symbol(&position.symbol)
                        .map(|i| i.as_str().to_string())
                        .unwrap_or_else(|| position.symbol.clone());
                    if let Some(quote) = aggregator.latest_quote(&base) {
                        if quote.last > 0.0 {
                            if let Err(e) =
                                positions.update_position_pnl(&position.id, quote.last).await
                            {
                                warn!(position = %position.id, error = %e, "PnL update failed");
                            }
                        }
                    }
                }
            }
        });
    }

    // ── 8. Control API ───────────────────────────────────────────────────
    let bind_addr =
        std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let engine = engine.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(engine);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind control API");
                    return;
                }
            };
            info!(addr = %bind_addr, "control API listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "control API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    engine.stop().await;

    info!("Meridian engine shut down complete.");
    Ok(())
}
