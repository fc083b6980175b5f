//! Dynamic trailing-stop engine for leveraged perpetual-futures positions.
//!
//! A background monitor observes open positions on a 5-second cadence and,
//! per position, tightens the on-exchange stop-loss, leaves it alone, or
//! closes the position at market once the stop has been overrun. Stops only
//! ever tighten: the engine derives an R multiple from the registered
//! initial stop, locks in a configured share of it per R-band, and trails
//! the favorable price extreme by a volatility-adjusted ATR distance.
//!
//! The exchange client, stop-loss executor, and decision persistence are
//! supplied by the host through the traits in [`adapter`], [`owner`], and
//! [`decision`]. Monitors are shared per exchange account through
//! [`shared::TrailingStopManager`].

pub mod adapter;
pub mod atr;
pub mod calculator;
pub mod config;
pub mod decision;
pub mod monitor;
pub mod owner;
pub mod registry;
pub mod shared;
pub mod snapshot;
pub mod types;

pub use adapter::{AdapterError, KlineSource, RawRecord, TradingClient};
pub use atr::{wilder_atr, AtrError, AtrSource, KlineAtrSource};
pub use calculator::{CalculatorError, RiskView, TrailingCalculator, TrailingDecision};
pub use config::{AssetClassRule, AssetProfile, RegimeAdjustment, TrailingBand, TrailingConfig};
pub use decision::{
    DecisionAction, DecisionRecord, DecisionRecorder, RecordError, StopLossDecision,
    TracingDecisionRecorder,
};
pub use monitor::{validate_stop, Monitor, StopValidity, TrailingStopMonitor};
pub use owner::Owner;
pub use registry::{RiskRegistry, RiskState};
pub use shared::{AcquireError, MonitorFactory, SharedMonitorHandle, TrailingStopManager};
pub use snapshot::{PositionSnapshot, SnapshotError};
pub use types::{AtrInterval, Kline, PositionSide};
