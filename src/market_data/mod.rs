pub mod aggregator;
pub mod feed;

// Re-export the aggregator types for convenient access
// (e.g. `use crate::market_data::MarketDataAggregator`).
pub use aggregator::{MarketDataAggregator, MarketDataEvent, CANDLE_BUFFER_CAPACITY};
pub use feed::{FeedConfig, FeedState, MarketDataFeed};

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::types::Ohlcv;

/// Source of historical bars for backfill. Implemented by the broker client;
/// kept as a trait so the feed and tests do not depend on HTTP plumbing.
#[async_trait]
pub trait BarSource: Send + Sync {
    /// Fetch the most recent `bar_count` bars at `timeframe_minutes`.
    async fn historical_bars(
        &self,
        symbol: &str,
        bar_count: u32,
        timeframe_minutes: u32,
    ) -> EngineResult<Vec<Ohlcv>>;
}
