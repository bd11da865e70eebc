// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the streaming indicators used by
// the trading engine.  Every public function returns an empty Vec or `None`
// on insufficient data, so callers are forced to handle the warm-up window.

pub mod atr;
pub mod ema;
pub mod rsi;
pub mod vwap;

pub use atr::calculate_atr;
pub use ema::calculate_ema;
pub use rsi::calculate_rsi;
pub use vwap::calculate_vwap;
