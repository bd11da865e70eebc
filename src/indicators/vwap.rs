// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP is the cumulative sum of typical price weighted by volume:
//
//   typical = (high + low + close) / 3
//   VWAP    = sum(typical * volume) / sum(volume)
//
// The caller is responsible for passing only the current session's candles;
// VWAP resets at the session boundary by construction.
// =============================================================================

use crate::types::Ohlcv;

/// Compute VWAP over the given candles.
///
/// Returns `None` when there is no volume yet (empty input or all zero
/// volumes) or the result is non-finite.
pub fn calculate_vwap(candles: &[Ohlcv]) -> Option<f64> {
    let mut pv_sum = 0.0;
    let mut volume_sum = 0.0;

    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        volume_sum += c.volume;
    }

    if volume_sum <= 0.0 {
        return None;
    }

    let vwap = pv_sum / volume_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(high: f64, low: f64, close: f64, volume: f64) -> Ohlcv {
        Ohlcv {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn vwap_empty_is_none() {
        assert!(calculate_vwap(&[]).is_none());
    }

    #[test]
    fn vwap_zero_volume_is_none() {
        let candles = vec![candle(101.0, 99.0, 100.0, 0.0); 5];
        assert!(calculate_vwap(&candles).is_none());
    }

    #[test]
    fn vwap_single_candle_is_typical_price() {
        let candles = vec![candle(102.0, 98.0, 100.0, 500.0)];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 100.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_weights_by_volume() {
        // Typical prices 100 and 200, volumes 300 and 100:
        // VWAP = (100*300 + 200*100) / 400 = 125.
        let candles = vec![
            candle(101.0, 99.0, 100.0, 300.0),
            candle(201.0, 199.0, 200.0, 100.0),
        ];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 125.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_sits_inside_price_range() {
        let candles: Vec<Ohlcv> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base + 1.0, base - 1.0, base, 100.0 + i as f64 * 10.0)
            })
            .collect();
        let vwap = calculate_vwap(&candles).unwrap();
        assert!(vwap > 100.0);
        assert!(vwap < 120.0);
    }
}
