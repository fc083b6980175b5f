//! Position Snapshot Parsing
//!
//! Converts the loosely-typed position records returned by exchange adapters
//! into strictly validated values. This module is the only place that
//! tolerates payload shape drift; everything downstream consumes the typed
//! [`PositionSnapshot`] exclusively.

use serde_json::Value;
use thiserror::Error;

use crate::adapter::RawRecord;
use crate::types::{position_key, PositionSide};

const DEFAULT_LEVERAGE: u32 = 5;

/// Essential information about an individual position used by the trailing
/// stop logic. Immutable for the lifetime of one monitor tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub mark_price: f64,
    /// Absolute position size.
    pub quantity: f64,
    pub leverage: u32,
}

impl PositionSnapshot {
    /// Stable key for referencing the snapshot inside caches (symbol + side).
    pub fn key(&self) -> String {
        position_key(&self.symbol, self.side)
    }

    /// Parse a raw position record, validating every field it needs.
    pub fn from_record(record: &RawRecord) -> Result<Self, SnapshotError> {
        let symbol = string_field(record, "symbol")
            .map_err(|source| SnapshotError::Symbol { source })?;

        let side_raw = string_field(record, "side").map_err(|source| SnapshotError::Field {
            symbol: symbol.clone(),
            field: "side",
            source,
        })?;
        let side: PositionSide =
            side_raw
                .parse()
                .map_err(|_| SnapshotError::InvalidSide {
                    symbol: symbol.clone(),
                    side: side_raw,
                })?;

        let entry_price = positive_float_field(record, "entryPrice", &symbol)?;
        let mark_price = positive_float_field(record, "markPrice", &symbol)?;

        let quantity = float_field(record, "positionAmt")
            .map_err(|source| SnapshotError::Field {
                symbol: symbol.clone(),
                field: "positionAmt",
                source,
            })?
            .abs();

        // leverage is advisory; a missing or malformed value falls back
        let leverage = match float_field(record, "leverage") {
            Ok(lev) if lev > 0.0 => lev.max(1.0).round() as u32,
            _ => DEFAULT_LEVERAGE,
        };

        Ok(Self {
            symbol,
            side,
            entry_price,
            mark_price,
            quantity,
            leverage,
        })
    }
}

fn positive_float_field(
    record: &RawRecord,
    field: &'static str,
    symbol: &str,
) -> Result<f64, SnapshotError> {
    let value = float_field(record, field).map_err(|source| SnapshotError::Field {
        symbol: symbol.to_string(),
        field,
        source,
    })?;
    if value <= 0.0 {
        return Err(SnapshotError::Field {
            symbol: symbol.to_string(),
            field,
            source: FieldError::NonPositive(value),
        });
    }
    Ok(value)
}

/// Error naming the offending field of an unusable position record.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("position record missing symbol: {source}")]
    Symbol { source: FieldError },

    #[error("{symbol}: field `{field}`: {source}")]
    Field {
        symbol: String,
        field: &'static str,
        source: FieldError,
    },

    #[error("{symbol}: invalid side `{side}` (expected long or short)")]
    InvalidSide { symbol: String, side: String },
}

/// Why a single record field failed coercion.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("value missing")]
    Missing,

    #[error("empty string")]
    Empty,

    #[error("cannot convert {0} to a number")]
    NotNumeric(&'static str),

    #[error("cannot convert {0} to a string")]
    NotText(&'static str),

    #[error("invalid number: {0}")]
    Parse(#[from] std::num::ParseFloatError),

    #[error("must be > 0, got {0}")]
    NonPositive(f64),
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_field(record: &RawRecord, field: &str) -> Result<String, FieldError> {
    match record.get(field) {
        None | Some(Value::Null) => Err(FieldError::Missing),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Err(FieldError::Empty)
            } else {
                Ok(trimmed.to_string())
            }
        }
        Some(other) => Err(FieldError::NotText(value_kind(other))),
    }
}

fn float_field(record: &RawRecord, field: &str) -> Result<f64, FieldError> {
    match record.get(field) {
        None => Err(FieldError::Missing),
        Some(value) => float_from_value(value),
    }
}

/// Coerce a dynamically-typed value to `f64` with a rich error.
pub(crate) fn float_from_value(value: &Value) -> Result<f64, FieldError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or(FieldError::NotNumeric("number")),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err(FieldError::Empty);
            }
            Ok(trimmed.parse::<f64>()?)
        }
        Value::Null => Err(FieldError::Missing),
        other => Err(FieldError::NotNumeric(value_kind(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        value.as_object().expect("test record must be an object").clone()
    }

    #[test]
    fn test_parse_full_record() {
        let raw = record(json!({
            "symbol": "BTCUSDT",
            "side": "LONG",
            "entryPrice": "100.0",
            "markPrice": 100.5,
            "positionAmt": "-0.75",
            "leverage": "10",
        }));
        let snap = PositionSnapshot::from_record(&raw).unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.side, PositionSide::Long);
        assert_eq!(snap.entry_price, 100.0);
        assert_eq!(snap.mark_price, 100.5);
        assert_eq!(snap.quantity, 0.75); // absolute value
        assert_eq!(snap.leverage, 10);
        assert_eq!(snap.key(), "BTCUSDT_long");
    }

    #[test]
    fn test_leverage_defaults_and_rounding() {
        let base = json!({
            "symbol": "ETHUSDT",
            "side": "short",
            "entryPrice": 2000.0,
            "markPrice": 1990.0,
            "positionAmt": 1.0,
        });

        let snap = PositionSnapshot::from_record(&record(base.clone())).unwrap();
        assert_eq!(snap.leverage, 5);

        let mut with_lev = base.clone();
        with_lev["leverage"] = json!(7.6);
        let snap = PositionSnapshot::from_record(&record(with_lev)).unwrap();
        assert_eq!(snap.leverage, 8);

        let mut tiny = base;
        tiny["leverage"] = json!(0.4);
        let snap = PositionSnapshot::from_record(&record(tiny)).unwrap();
        // clamped up to 1 before rounding
        assert_eq!(snap.leverage, 1);
    }

    #[test]
    fn test_invalid_side_rejected() {
        let raw = record(json!({
            "symbol": "BTCUSDT",
            "side": "buy",
            "entryPrice": 100.0,
            "markPrice": 100.5,
            "positionAmt": 1.0,
        }));
        let err = PositionSnapshot::from_record(&raw).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidSide { .. }));
    }

    #[test]
    fn test_error_names_offending_field() {
        let raw = record(json!({
            "symbol": "BTCUSDT",
            "side": "long",
            "entryPrice": "not-a-price",
            "markPrice": 100.5,
            "positionAmt": 1.0,
        }));
        let err = PositionSnapshot::from_record(&raw).unwrap_err();
        assert!(err.to_string().contains("entryPrice"), "got: {}", err);

        let raw = record(json!({
            "symbol": "BTCUSDT",
            "side": "long",
            "entryPrice": 100.0,
            "markPrice": 100.5,
        }));
        let err = PositionSnapshot::from_record(&raw).unwrap_err();
        assert!(err.to_string().contains("positionAmt"), "got: {}", err);
    }

    #[test]
    fn test_non_positive_prices_rejected() {
        let raw = record(json!({
            "symbol": "BTCUSDT",
            "side": "long",
            "entryPrice": 0.0,
            "markPrice": 100.5,
            "positionAmt": 1.0,
        }));
        assert!(PositionSnapshot::from_record(&raw).is_err());
    }

    #[test]
    fn test_missing_symbol() {
        let raw = record(json!({
            "side": "long",
            "entryPrice": 100.0,
            "markPrice": 100.5,
            "positionAmt": 1.0,
        }));
        let err = PositionSnapshot::from_record(&raw).unwrap_err();
        assert!(matches!(err, SnapshotError::Symbol { .. }));
    }

    #[test]
    fn test_float_from_value_kinds() {
        assert!(float_from_value(&json!("  42.5 ")).unwrap() == 42.5);
        assert!(float_from_value(&json!(7)).unwrap() == 7.0);
        assert!(matches!(float_from_value(&json!("")), Err(FieldError::Empty)));
        assert!(matches!(
            float_from_value(&json!(true)),
            Err(FieldError::NotNumeric("bool"))
        ));
    }
}
