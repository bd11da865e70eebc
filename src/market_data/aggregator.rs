// =============================================================================
// Market-Data Aggregator — tick aggregation, candle buffers, indicators
// =============================================================================
//
// The aggregator exclusively owns the candle/quote/opening-range caches; the
// engine only reads them. Each symbol's tick aggregation runs behind its own
// mutex so one busy symbol never blocks another, and the current (unclosed)
// candle lives in a distinct cell from the buffered history: promotion on
// bucket rollover is the single place where the history grows.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::indicators;
use crate::rules::session::eastern_today_at;
use crate::types::{Ohlcv, OpeningRange, Quote};

/// Closed candles retained per symbol.
pub const CANDLE_BUFFER_CAPACITY: usize = 200;
/// Candle bucket width in seconds (5-minute bars).
pub const BUCKET_SECONDS: i64 = 300;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events published by the aggregator. The engine subscribes to drive
/// event-based strategy re-evaluation.
#[derive(Debug, Clone)]
pub enum MarketDataEvent {
    /// A candle bucket rolled over and the finished candle entered the buffer.
    CandleClosed { symbol: String, candle: Ohlcv },
    /// Backfill for a symbol finished merging; indicators are warm.
    HistoricalBarsLoaded { symbol: String, count: usize },
    /// The wire connection was re-established and state was restored.
    Restored,
    /// Reconnect attempts are exhausted; the feed gave up.
    ConnectionLost,
}

// ---------------------------------------------------------------------------
// Per-symbol book
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SymbolBook {
    /// The current (open) candle, promoted to `candles` on bucket rollover.
    current: Option<Ohlcv>,
    /// Closed candles, oldest first, bounded by CANDLE_BUFFER_CAPACITY.
    candles: VecDeque<Ohlcv>,
    /// Latest quote.
    quote: Option<Quote>,
}

impl SymbolBook {
    fn push_closed(&mut self, candle: Ohlcv) {
        self.candles.push_back(candle);
        while self.candles.len() > CANDLE_BUFFER_CAPACITY {
            self.candles.pop_front();
        }
    }
}

/// Round a timestamp down to its 5-minute bucket start.
pub fn bucket_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let bucket = secs - secs.rem_euclid(BUCKET_SECONDS);
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

type OrKey = (String, u32, u32);

pub struct MarketDataAggregator {
    books: RwLock<HashMap<String, Arc<Mutex<SymbolBook>>>>,
    /// Completed opening ranges, keyed by (symbol, startMinute, endMinute).
    opening_ranges: RwLock<HashMap<OrKey, OpeningRange>>,
    events: broadcast::Sender<MarketDataEvent>,
}

impl MarketDataAggregator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            books: RwLock::new(HashMap::new()),
            opening_ranges: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to aggregator events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MarketDataEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: MarketDataEvent) {
        // Send fails only when nobody listens, which is fine.
        let _ = self.events.send(event);
    }

    fn book(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        if let Some(book) = self.books.read().get(symbol) {
            return book.clone();
        }
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolBook::default())))
            .clone()
    }

    /// Pre-create the book for a symbol so reads never miss.
    pub fn ensure_symbol(&self, symbol: &str) {
        let _ = self.book(symbol);
    }

    // -------------------------------------------------------------------------
    // Tick ingestion
    // -------------------------------------------------------------------------

    /// Fold one trade tick into the current candle, closing it on bucket
    /// rollover.
    pub fn on_trade(&self, symbol: &str, price: f64, size: f64, timestamp: DateTime<Utc>) {
        if symbol.is_empty() || !price.is_finite() {
            warn!(symbol, price, "discarding malformed trade tick");
            return;
        }

        let bucket = bucket_start(timestamp);
        let book = self.book(symbol);
        let closed = {
            let mut book = book.lock();
            if let Some(current) = book.current.as_mut().filter(|c| c.timestamp == bucket) {
                current.high = current.high.max(price);
                current.low = current.low.min(price);
                current.close = price;
                current.volume += size;
                None
            } else {
                let finished = book.current.take();
                book.current = Some(Ohlcv {
                    timestamp: bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: size,
                });
                if let Some(finished) = finished {
                    book.push_closed(finished);
                }
                finished
            }
        };

        if let Some(candle) = closed {
            debug!(symbol, close = candle.close, ts = %candle.timestamp, "candle closed");
            self.publish(MarketDataEvent::CandleClosed {
                symbol: symbol.to_string(),
                candle,
            });
        }
    }

    /// Update the latest-quote cache. Quotes do not touch candles.
    pub fn on_quote(&self, quote: Quote) {
        if quote.symbol.is_empty() {
            warn!("discarding quote without symbol");
            return;
        }
        let book = self.book(&quote.symbol);
        book.lock().quote = Some(quote);
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Merge historical bars with live bars that accumulated meanwhile.
    ///
    /// Historical bars colliding with (or newer than) the oldest live bar are
    /// dropped; the rest are prepended and the buffer keeps the 200 newest.
    pub fn merge_historical(&self, symbol: &str, mut bars: Vec<Ohlcv>) -> usize {
        bars.sort_by_key(|b| b.timestamp);

        let book = self.book(symbol);
        let merged = {
            let mut book = book.lock();
            let oldest_live = book.candles.front().map(|c| c.timestamp);
            let mut kept = 0;
            // Prepend in reverse so ordering is preserved.
            for bar in bars.into_iter().rev() {
                if let Some(oldest) = oldest_live {
                    if bar.timestamp >= oldest {
                        continue;
                    }
                }
                book.candles.push_front(bar);
                kept += 1;
            }
            while book.candles.len() > CANDLE_BUFFER_CAPACITY {
                book.candles.pop_front();
            }
            kept
        };

        info!(symbol, merged, "historical bars merged");
        self.publish(MarketDataEvent::HistoricalBarsLoaded {
            symbol: symbol.to_string(),
            count: merged,
        });
        merged
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// The most recent `count` closed candles, oldest first.
    pub fn candles(&self, symbol: &str, count: usize) -> Vec<Ohlcv> {
        let book = self.book(symbol);
        let book = book.lock();
        let skip = book.candles.len().saturating_sub(count);
        book.candles.iter().skip(skip).copied().collect()
    }

    pub fn candle_count(&self, symbol: &str) -> usize {
        self.book(symbol).lock().candles.len()
    }

    /// The current (unclosed) candle, if a tick has arrived this bucket.
    pub fn current_candle(&self, symbol: &str) -> Option<Ohlcv> {
        self.book(symbol).lock().current
    }

    pub fn latest_quote(&self, symbol: &str) -> Option<Quote> {
        self.book(symbol).lock().quote.clone()
    }

    // -------------------------------------------------------------------------
    // Indicators
    // -------------------------------------------------------------------------

    /// Latest EMA over closed candles. Requires `period >= 1` candles.
    pub fn ema(&self, symbol: &str, period: usize) -> Option<f64> {
        if symbol.is_empty() || period < 1 {
            warn!(symbol, period, "invalid EMA request");
            return None;
        }
        let closes: Vec<f64> = self
            .candles(symbol, CANDLE_BUFFER_CAPACITY)
            .iter()
            .map(|c| c.close)
            .collect();
        indicators::ema::latest_ema(&closes, period)
    }

    /// Latest RSI over closed candles. Requires `period >= 2`.
    pub fn rsi(&self, symbol: &str, period: usize) -> Option<f64> {
        if symbol.is_empty() || period < 2 {
            warn!(symbol, period, "invalid RSI request");
            return None;
        }
        let closes: Vec<f64> = self
            .candles(symbol, CANDLE_BUFFER_CAPACITY)
            .iter()
            .map(|c| c.close)
            .collect();
        indicators::rsi::latest_rsi(&closes, period)
    }

    /// Latest ATR over closed candles. Requires `period >= 1`.
    pub fn atr(&self, symbol: &str, period: usize) -> Option<f64> {
        if symbol.is_empty() || period < 1 {
            warn!(symbol, period, "invalid ATR request");
            return None;
        }
        let candles = self.candles(symbol, CANDLE_BUFFER_CAPACITY);
        indicators::atr::calculate_atr(&candles, period)
    }

    /// Session VWAP over today's (Eastern) closed candles.
    pub fn vwap(&self, symbol: &str) -> Option<f64> {
        if symbol.is_empty() {
            warn!("invalid VWAP request: empty symbol");
            return None;
        }
        let candles = self.candles(symbol, CANDLE_BUFFER_CAPACITY);
        let today = candles.last()?.timestamp.with_timezone(&New_York).date_naive();
        let session: Vec<Ohlcv> = candles
            .into_iter()
            .filter(|c| c.timestamp.with_timezone(&New_York).date_naive() == today)
            .collect();
        indicators::vwap::calculate_vwap(&session)
    }

    // -------------------------------------------------------------------------
    // Opening ranges
    // -------------------------------------------------------------------------

    /// Derive (or fetch from cache) the opening range for a symbol over the
    /// `[start_minute, end_minute)` Eastern window.
    ///
    /// `is_complete` is true once `now` has reached the window end; complete
    /// ranges are cached and immutable.
    pub fn opening_range(
        &self,
        symbol: &str,
        start_minute: u32,
        end_minute: u32,
        now: DateTime<Utc>,
    ) -> Option<OpeningRange> {
        let key: OrKey = (symbol.to_string(), start_minute, end_minute);
        if let Some(cached) = self.opening_ranges.read().get(&key) {
            return Some(cached.clone());
        }

        let today = now.with_timezone(&New_York).date_naive();
        let candles = self.candles(symbol, CANDLE_BUFFER_CAPACITY);
        let in_window: Vec<&Ohlcv> = candles
            .iter()
            .filter(|c| {
                let local = c.timestamp.with_timezone(&New_York);
                let minute = local.hour() * 60 + local.minute();
                local.date_naive() == today && minute >= start_minute && minute < end_minute
            })
            .collect();

        if in_window.is_empty() {
            return None;
        }

        let high = in_window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = in_window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let now_minute = {
            let local = now.with_timezone(&New_York);
            local.hour() * 60 + local.minute()
        };

        let range = OpeningRange {
            high,
            low,
            start_time: eastern_today_at(now, start_minute),
            end_time: eastern_today_at(now, end_minute),
            is_complete: now_minute >= end_minute,
        };

        if range.is_complete {
            self.opening_ranges.write().insert(key, range.clone());
        }
        Some(range)
    }

    /// Install a previously persisted opening range (restart restore path).
    pub fn set_opening_range(
        &self,
        symbol: &str,
        start_minute: u32,
        end_minute: u32,
        range: OpeningRange,
    ) {
        let key: OrKey = (symbol.to_string(), start_minute, end_minute);
        self.opening_ranges.write().insert(key, range);
    }

    /// All cached (complete) opening ranges, for persistence at shutdown.
    pub fn cached_opening_ranges(&self) -> Vec<(String, u32, u32, OpeningRange)> {
        self.opening_ranges
            .read()
            .iter()
            .map(|((s, a, b), or)| (s.clone(), *a, *b, or.clone()))
            .collect()
    }
}

impl Default for MarketDataAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketDataAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataAggregator")
            .field("symbols", &self.books.read().len())
            .field("opening_ranges", &self.opening_ranges.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn bucket_start_rounds_down_to_five_minutes() {
        assert_eq!(bucket_start(ts(14, 32, 17)), ts(14, 30, 0));
        assert_eq!(bucket_start(ts(14, 35, 0)), ts(14, 35, 0));
        assert_eq!(bucket_start(ts(14, 39, 59)), ts(14, 35, 0));
    }

    #[test]
    fn ticks_in_same_bucket_update_current_candle() {
        let agg = MarketDataAggregator::new();
        agg.on_trade("ES", 5000.0, 2.0, ts(14, 30, 5));
        agg.on_trade("ES", 5002.0, 1.0, ts(14, 31, 0));
        agg.on_trade("ES", 4999.0, 3.0, ts(14, 34, 59));

        let current = agg.current_candle("ES").unwrap();
        assert_eq!(current.timestamp, ts(14, 30, 0));
        assert_eq!(current.open, 5000.0);
        assert_eq!(current.high, 5002.0);
        assert_eq!(current.low, 4999.0);
        assert_eq!(current.close, 4999.0);
        assert_eq!(current.volume, 6.0);
        // Nothing closed yet.
        assert_eq!(agg.candle_count("ES"), 0);
    }

    #[test]
    fn bucket_rollover_promotes_and_emits_event() {
        let agg = MarketDataAggregator::new();
        let mut events = agg.subscribe_events();

        agg.on_trade("ES", 5000.0, 1.0, ts(14, 30, 0));
        agg.on_trade("ES", 5001.0, 1.0, ts(14, 35, 0)); // new bucket

        assert_eq!(agg.candle_count("ES"), 1);
        let closed = agg.candles("ES", 10);
        assert_eq!(closed[0].timestamp, ts(14, 30, 0));
        assert_eq!(closed[0].close, 5000.0);

        let current = agg.current_candle("ES").unwrap();
        assert_eq!(current.timestamp, ts(14, 35, 0));
        assert_eq!(current.open, 5001.0);

        match events.try_recv().unwrap() {
            MarketDataEvent::CandleClosed { symbol, candle } => {
                assert_eq!(symbol, "ES");
                assert_eq!(candle.close, 5000.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn buffer_bounded_at_capacity() {
        let agg = MarketDataAggregator::new();
        // 250 bucket rollovers.
        for i in 0..250i64 {
            let t = Utc.timestamp_opt(1_736_900_000 + i * BUCKET_SECONDS, 0).unwrap();
            agg.on_trade("NQ", 18000.0 + i as f64, 1.0, t);
        }
        assert!(agg.candle_count("NQ") <= CANDLE_BUFFER_CAPACITY);
        assert_eq!(agg.candle_count("NQ"), CANDLE_BUFFER_CAPACITY);

        // Successive candles are exactly one bucket apart.
        let candles = agg.candles("NQ", CANDLE_BUFFER_CAPACITY);
        for pair in candles.windows(2) {
            assert_eq!(
                pair[1].timestamp.timestamp() - pair[0].timestamp.timestamp(),
                BUCKET_SECONDS
            );
        }
    }

    #[test]
    fn quotes_update_cache_independently() {
        let agg = MarketDataAggregator::new();
        assert!(agg.latest_quote("ES").is_none());

        agg.on_quote(Quote {
            symbol: "ES".into(),
            bid: 4999.75,
            ask: 5000.25,
            last: 5000.0,
            volume: 12.0,
            timestamp: ts(14, 30, 0),
        });
        let q = agg.latest_quote("ES").unwrap();
        assert_eq!(q.last, 5000.0);
        // Quotes never create candles.
        assert_eq!(agg.candle_count("ES"), 0);
        assert!(agg.current_candle("ES").is_none());
    }

    #[test]
    fn merge_historical_keeps_older_bars_only() {
        let agg = MarketDataAggregator::new();
        // Two live candles at 14:30 and 14:35.
        agg.on_trade("ES", 5000.0, 1.0, ts(14, 30, 0));
        agg.on_trade("ES", 5001.0, 1.0, ts(14, 35, 0));
        agg.on_trade("ES", 5002.0, 1.0, ts(14, 40, 0));
        assert_eq!(agg.candle_count("ES"), 2);

        let bar = |t: DateTime<Utc>, close: f64| Ohlcv {
            timestamp: t,
            open: close,
            high: close,
            low: close,
            close,
            volume: 10.0,
        };
        // One bar older than the live window, one colliding, one newer.
        let merged = agg.merge_historical(
            "ES",
            vec![
                bar(ts(14, 25, 0), 4998.0),
                bar(ts(14, 30, 0), 9999.0),
                bar(ts(14, 45, 0), 9999.0),
            ],
        );
        assert_eq!(merged, 1);

        let candles = agg.candles("ES", 10);
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].timestamp, ts(14, 25, 0));
        assert_eq!(candles[0].close, 4998.0);
        // The colliding bar never replaced the live candle.
        assert_eq!(candles[1].close, 5000.0);
    }

    #[test]
    fn merge_historical_respects_capacity() {
        let agg = MarketDataAggregator::new();
        agg.on_trade("ES", 5000.0, 1.0, ts(14, 30, 0));
        agg.on_trade("ES", 5001.0, 1.0, ts(14, 35, 0)); // one closed candle

        let bars: Vec<Ohlcv> = (0..300)
            .map(|i| {
                let t = ts(14, 30, 0) - chrono::Duration::seconds((i + 1) * BUCKET_SECONDS);
                Ohlcv {
                    timestamp: t,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                }
            })
            .collect();
        agg.merge_historical("ES", bars);
        assert_eq!(agg.candle_count("ES"), CANDLE_BUFFER_CAPACITY);

        // The newest candles survived trimming.
        let candles = agg.candles("ES", CANDLE_BUFFER_CAPACITY);
        assert_eq!(candles.last().unwrap().close, 5000.0);
    }

    #[test]
    fn indicator_input_validation() {
        let agg = MarketDataAggregator::new();
        assert!(agg.ema("", 20).is_none());
        assert!(agg.ema("ES", 0).is_none());
        assert!(agg.rsi("ES", 1).is_none()); // RSI needs period >= 2
        assert!(agg.atr("ES", 0).is_none());
        assert!(agg.vwap("").is_none());
    }

    #[test]
    fn ema_over_closed_candles() {
        let agg = MarketDataAggregator::new();
        for i in 0..25i64 {
            let t = ts(13, 0, 0) + chrono::Duration::seconds(i * BUCKET_SECONDS);
            agg.on_trade("ES", 100.0 + i as f64, 1.0, t);
        }
        // 24 closed candles with closes 100..=123.
        let ema = agg.ema("ES", 20).unwrap();
        assert!(ema > 100.0 && ema < 123.0);
        // Not enough candles for a 50-period EMA.
        assert!(agg.ema("ES", 50).is_none());
    }

    #[test]
    fn vwap_requires_volume() {
        let agg = MarketDataAggregator::new();
        agg.on_trade("ES", 100.0, 0.0, ts(14, 30, 0));
        agg.on_trade("ES", 101.0, 0.0, ts(14, 35, 0));
        assert!(agg.vwap("ES").is_none());

        agg.on_trade("ES", 102.0, 5.0, ts(14, 40, 0));
        agg.on_trade("ES", 103.0, 5.0, ts(14, 45, 0));
        assert!(agg.vwap("ES").is_some());
    }

    #[test]
    fn opening_range_derivation_and_completion() {
        let agg = MarketDataAggregator::new();
        // NY open 09:30 ET == 14:30 UTC in January. Build the 09:30-09:45
        // range from three 5-minute candles.
        for (i, (h, l)) in [(5002.0, 4998.0), (5005.0, 4999.0), (5001.0, 4995.0)]
            .iter()
            .enumerate()
        {
            let start = ts(14, 30 + 5 * i as u32, 0);
            agg.on_trade("ES", *h, 1.0, start);
            agg.on_trade("ES", *l, 1.0, start + chrono::Duration::seconds(60));
            // Roll the bucket over so the candle closes.
        }
        agg.on_trade("ES", 5000.0, 1.0, ts(14, 45, 0));

        // Before the window ends the range is incomplete and not cached.
        let or = agg
            .opening_range("ES", 570, 585, ts(14, 40, 0))
            .expect("partial range");
        assert!(!or.is_complete);

        // At/after the window end it completes and caches.
        let or = agg
            .opening_range("ES", 570, 585, ts(14, 45, 0))
            .expect("complete range");
        assert!(or.is_complete);
        assert_eq!(or.high, 5005.0);
        assert_eq!(or.low, 4995.0);
        assert_eq!(agg.cached_opening_ranges().len(), 1);
    }

    #[test]
    fn restored_opening_range_wins_over_derivation() {
        let agg = MarketDataAggregator::new();
        let restored = OpeningRange {
            high: 5100.0,
            low: 5050.0,
            start_time: ts(14, 30, 0),
            end_time: ts(14, 45, 0),
            is_complete: true,
        };
        agg.set_opening_range("ES", 570, 585, restored.clone());
        let or = agg.opening_range("ES", 570, 585, ts(15, 0, 0)).unwrap();
        assert_eq!(or, restored);
    }

    #[test]
    fn opening_range_empty_window_is_none() {
        let agg = MarketDataAggregator::new();
        agg.on_trade("ES", 5000.0, 1.0, ts(18, 0, 0)); // 13:00 ET
        assert!(agg.opening_range("ES", 570, 585, ts(18, 5, 0)).is_none());
    }
}
