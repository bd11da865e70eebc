// =============================================================================
// Instrument Table — CME futures contract constants
// =============================================================================
//
// Tick size is the minimum price increment; tick value is the dollar value of
// one tick per contract. Point value = tick_value / tick_size.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The futures instruments the engine knows how to trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Instrument {
    /// E-mini S&P 500
    Es,
    /// E-mini Nasdaq-100
    Nq,
    /// E-mini Dow
    Ym,
    /// E-mini Russell 2000
    Rty,
    /// Crude Oil
    Cl,
    /// Gold
    Gc,
    /// Silver
    Si,
}

impl Instrument {
    /// Canonical base symbol, e.g. `"ES"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es => "ES",
            Self::Nq => "NQ",
            Self::Ym => "YM",
            Self::Rty => "RTY",
            Self::Cl => "CL",
            Self::Gc => "GC",
            Self::Si => "SI",
        }
    }

    /// Minimum price increment.
    pub fn tick_size(&self) -> f64 {
        match self {
            Self::Es => 0.25,
            Self::Nq => 0.25,
            Self::Ym => 1.00,
            Self::Rty => 0.10,
            Self::Cl => 0.01,
            Self::Gc => 0.10,
            Self::Si => 0.005,
        }
    }

    /// Dollar value of one tick per contract.
    pub fn tick_value(&self) -> f64 {
        match self {
            Self::Es => 12.50,
            Self::Nq => 5.00,
            Self::Ym => 5.00,
            Self::Rty => 5.00,
            Self::Cl => 10.00,
            Self::Gc => 10.00,
            Self::Si => 25.00,
        }
    }

    /// Dollar value of a one-point move per contract.
    pub fn point_value(&self) -> f64 {
        self.tick_value() / self.tick_size()
    }

    /// Extract the base instrument from a contract symbol, e.g. "ESH6" or
    /// "RTYM6". Longest prefix wins so "RTY" is not misread as an unknown
    /// two-letter base.
    pub fn from_contract_symbol(symbol: &str) -> Option<Instrument> {
        let upper = symbol.to_uppercase();
        for len in (2..=3).rev() {
            if upper.len() >= len {
                if let Ok(inst) = upper[..len].parse::<Instrument>() {
                    return Some(inst);
                }
            }
        }
        None
    }

    /// All supported instruments.
    pub fn all() -> &'static [Instrument] {
        &[
            Self::Es,
            Self::Nq,
            Self::Ym,
            Self::Rty,
            Self::Cl,
            Self::Gc,
            Self::Si,
        ]
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ES" => Ok(Self::Es),
            "NQ" => Ok(Self::Nq),
            "YM" => Ok(Self::Ym),
            "RTY" => Ok(Self::Rty),
            "CL" => Ok(Self::Cl),
            "GC" => Ok(Self::Gc),
            "SI" => Ok(Self::Si),
            other => Err(format!("unknown instrument symbol: {other}")),
        }
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
