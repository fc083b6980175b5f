//! Owner Interface
//!
//! The monitor runs on behalf of a host trader (its owner). The relation is
//! lookup, not ownership: the monitor reaches its collaborators (trading
//! client, stop-loss executor, decision recorder) through the owner, and the
//! owner reference is replaced atomically when accounts are shared between
//! traders.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{AdapterError, TradingClient};
use crate::decision::{DecisionAction, DecisionRecorder, StopLossDecision};

/// All context the trailing-stop monitor needs from its host trader.
#[async_trait]
pub trait Owner: Send + Sync {
    /// Stable identifier of the trader.
    fn trader_id(&self) -> String;

    /// Display name of the trader, for logs.
    fn trader_name(&self) -> String;

    /// Opaque fingerprint of the exchange account this trader operates on.
    /// Traders sharing an account share one monitor.
    fn account_key(&self) -> String;

    /// The exchange client used for position/order queries and market closes.
    fn trading_client(&self) -> Arc<dyn TradingClient>;

    /// Place (or replace) a reduce-only stop order per the decision.
    ///
    /// The owner's implementation handles order cancellation, dual-side
    /// position checks, and decision logging for the update itself.
    async fn execute_stop_loss(
        &self,
        decision: &StopLossDecision,
        action: &DecisionAction,
    ) -> Result<(), AdapterError>;

    /// Recorder for synthetic records (emergency closes); `None` disables.
    fn decision_recorder(&self) -> Option<Arc<dyn DecisionRecorder>>;
}
