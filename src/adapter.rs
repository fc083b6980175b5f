//! Exchange Adapter Interfaces
//!
//! The trailing-stop engine never talks to an exchange directly. It consumes
//! the small trait surface defined here, implemented by whatever REST/WS
//! client the host application uses. Position and order payloads stay
//! dynamically keyed; [`crate::snapshot`] is the only place that tolerates
//! shape drift.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AtrInterval, Kline};

/// A loosely-typed exchange record (position, order, or fill).
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Error type for exchange adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Exchange API error: {0}")]
    Api(String),

    #[error("Adapter error: {0}")]
    Other(String),
}

/// Minimum trading surface the monitor needs from an exchange client.
///
/// Mirrors the subset of the host trader's client so this crate stays
/// decoupled from any concrete exchange SDK.
#[async_trait]
pub trait TradingClient: Send + Sync {
    /// Fetch all open positions on the account.
    async fn get_positions(&self) -> Result<Vec<RawRecord>, AdapterError>;

    /// Fetch open orders for a symbol.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<RawRecord>, AdapterError>;

    /// Close a long position at market. `quantity == 0.0` closes the full position.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<RawRecord, AdapterError>;

    /// Close a short position at market. `quantity == 0.0` closes the full position.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<RawRecord, AdapterError>;
}

/// Historical kline provider used by the ATR fetcher.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch the most recent `limit` klines for `symbol` at `interval`.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: AtrInterval,
        limit: usize,
    ) -> Result<Vec<Kline>, AdapterError>;
}
