//! Common Types Module
//!
//! Shared types used across the crate to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tolerance for comparing two stop prices.
pub const PRICE_EPSILON: f64 = 1e-6;

/// Returns true when two prices are equal within [`PRICE_EPSILON`].
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= PRICE_EPSILON
}

/// Direction of a perpetual-futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            _ => Err(format!("Unknown side: {}. Valid options: long, short", s)),
        }
    }
}

/// Kline interval used for ATR computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtrInterval {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl std::fmt::Display for AtrInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtrInterval::OneHour => write!(f, "1h"),
            AtrInterval::FourHour => write!(f, "4h"),
            AtrInterval::OneDay => write!(f, "1d"),
        }
    }
}

impl std::str::FromStr for AtrInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1h" => Ok(AtrInterval::OneHour),
            "4h" => Ok(AtrInterval::FourHour),
            "1d" => Ok(AtrInterval::OneDay),
            _ => Err(format!("Unknown interval: {}. Valid options: 1h, 4h, 1d", s)),
        }
    }
}

/// Exchange-agnostic candle data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Stable cache key for a position (symbol + lowercase side).
pub fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{}_{}", symbol, side)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_round_trip() {
        assert_eq!("long".parse::<PositionSide>().unwrap(), PositionSide::Long);
        assert_eq!(" SHORT ".parse::<PositionSide>().unwrap(), PositionSide::Short);
        assert!("buy".parse::<PositionSide>().is_err());
        assert_eq!(PositionSide::Long.to_string(), "long");
    }

    #[test]
    fn test_interval_round_trip() {
        assert_eq!("1h".parse::<AtrInterval>().unwrap(), AtrInterval::OneHour);
        assert_eq!("4H".parse::<AtrInterval>().unwrap(), AtrInterval::FourHour);
        assert_eq!(AtrInterval::OneDay.to_string(), "1d");
        assert!("5m".parse::<AtrInterval>().is_err());
    }

    #[test]
    fn test_position_key() {
        assert_eq!(position_key("BTCUSDT", PositionSide::Long), "BTCUSDT_long");
        assert_eq!(position_key("SOLUSDT", PositionSide::Short), "SOLUSDT_short");
    }

    #[test]
    fn test_approx_eq() {
        assert!(approx_eq(100.45, 100.45 + 1e-7));
        assert!(!approx_eq(100.45, 100.46));
    }
}
