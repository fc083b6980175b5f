//! Trailing Stop Monitor
//!
//! The periodic driver. Every 5 seconds it pulls the account's open
//! positions, reconciles the risk registry, runs each position through the
//! trailing calculator, validates the result, and either tightens the
//! on-exchange stop order or closes the position at market when the stop has
//! been overrun.
//!
//! The tick body is sequential and non-re-entrant: a tick that outlives the
//! interval simply causes the next fire to be skipped. Adapter failures skip
//! the affected position (or the whole tick) and the next tick retries; no
//! retry loops live in here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, RawRecord};
use crate::atr::AtrSource;
use crate::calculator::{current_r_multiple, RiskView, TrailingCalculator};
use crate::config::TrailingConfig;
use crate::decision::{DecisionAction, DecisionRecord, StopLossDecision};
use crate::owner::Owner;
use crate::registry::{RiskRegistry, RiskState};
use crate::snapshot::{float_from_value, PositionSnapshot};
use crate::types::{approx_eq, position_key, PositionSide};

const TRAILING_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Operations the shared manager needs from a monitor.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Start the background tick. Idempotent; rejects re-entry while running.
    fn start(self: Arc<Self>);

    /// Stop the background tick and wait for it to exit. Idempotent.
    async fn stop(&self);

    /// Rebind the monitor to a different owner on the same account.
    fn set_owner(&self, owner: Arc<dyn Owner>);

    /// Drop the risk state for a position (after it closed).
    fn clear_position(&self, symbol: &str, side: PositionSide);

    /// Record the initial stop for a position, enabling R-based management.
    fn register_initial_stop(&self, symbol: &str, side: PositionSide, stop: f64);
}

/// Result of the stop validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopValidity {
    /// Safe to submit
    Valid,
    /// Unsafe (would give back protected profit); skip
    Rejected,
    /// Already at or through the mark; the position must close at market
    WouldTrigger,
}

/// Validate a candidate stop against entry and mark prices.
///
/// `allow_initial_stop` permits a stop beyond entry when the exchange shows
/// no stop order and the initial defensive stop is being re-established.
pub fn validate_stop(
    side: PositionSide,
    entry_price: f64,
    new_stop: f64,
    mark_price: f64,
    allow_initial_stop: bool,
) -> StopValidity {
    match side {
        PositionSide::Long => {
            if !allow_initial_stop && new_stop < entry_price {
                return StopValidity::Rejected;
            }
            if new_stop >= mark_price {
                return StopValidity::WouldTrigger;
            }
        }
        PositionSide::Short => {
            if !allow_initial_stop && new_stop > entry_price {
                return StopValidity::Rejected;
            }
            if new_stop <= mark_price {
                return StopValidity::WouldTrigger;
            }
        }
    }
    StopValidity::Valid
}

/// Pick the protective stop price for `side` out of raw open orders.
///
/// Considers reduce-only stop orders (`STOP_MARKET` / `STOP` with
/// `closePosition`) whose position side matches; `BOTH` or missing position
/// sides fall back to the order's own `side` field. Among candidates the
/// most conservative wins: highest for long, lowest for short.
pub(crate) fn select_stop_from_orders(orders: &[RawRecord], side: PositionSide) -> Option<f64> {
    let target = match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
    };

    let mut best: Option<f64> = None;
    for order in orders {
        let order_type = order
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_uppercase();
        if order_type != "STOP_MARKET" && order_type != "STOP" {
            continue;
        }

        if !order
            .get("closePosition")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            continue;
        }

        let mut position_side = order
            .get("positionSide")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_uppercase();
        if position_side.is_empty() || position_side == "BOTH" {
            position_side = order
                .get("side")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_uppercase();
        }
        if position_side != target {
            continue;
        }

        let stop_price = match order.get("stopPrice").map(float_from_value) {
            Some(Ok(price)) if price > 0.0 => price,
            _ => continue,
        };

        best = Some(match (best, side) {
            (None, _) => stop_price,
            (Some(current), PositionSide::Long) => current.max(stop_price),
            (Some(current), PositionSide::Short) => current.min(stop_price),
        });
    }
    best
}

struct RunState {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

enum Outcome {
    Updated,
    Skipped,
    Failed,
}

/// Dynamic trailing-stop monitor for one exchange account.
pub struct TrailingStopMonitor {
    owner: RwLock<Arc<dyn Owner>>,
    calculator: TrailingCalculator,
    registry: RiskRegistry,
    run_state: Mutex<RunState>,
}

impl TrailingStopMonitor {
    /// Monitor with the built-in default trailing configuration.
    pub fn new(owner: Arc<dyn Owner>, atr: Arc<dyn AtrSource>) -> Self {
        Self::with_config(owner, atr, None)
    }

    /// Monitor with caller overrides merged onto the defaults.
    pub fn with_config(
        owner: Arc<dyn Owner>,
        atr: Arc<dyn AtrSource>,
        config: Option<&TrailingConfig>,
    ) -> Self {
        Self {
            owner: RwLock::new(owner),
            calculator: TrailingCalculator::with_config(atr, config),
            registry: RiskRegistry::new(),
            run_state: Mutex::new(RunState {
                running: false,
                shutdown: None,
                handle: None,
            }),
        }
    }

    fn owner(&self) -> Arc<dyn Owner> {
        Arc::clone(&*self.owner.read().expect("owner lock poisoned"))
    }

    /// Read-only view of the risk state for a position, if tracked.
    pub fn risk_state(&self, symbol: &str, side: PositionSide) -> Option<RiskState> {
        self.registry.snapshot(&position_key(symbol, side))
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TRAILING_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = TRAILING_CHECK_INTERVAL.as_secs(),
            "Trailing stop monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let client = self.owner().trading_client();
                    match client.get_positions().await {
                        Ok(positions) => self.process_positions(positions).await,
                        Err(e) => {
                            warn!(error = %e, "Failed to fetch positions; waiting for next cycle");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Trailing stop monitor exiting");
                    return;
                }
            }
        }
    }

    /// Run one reconciliation + trailing pass over raw position records.
    ///
    /// Normally invoked by the tick; public so hosts can drive the monitor
    /// from their own position feed.
    pub async fn process_positions(&self, positions: Vec<RawRecord>) {
        if positions.is_empty() {
            self.evict_inactive(&HashSet::new());
            debug!("No open positions; nothing to check");
            return;
        }

        let mut active = Vec::new();
        let mut active_keys = HashSet::new();
        for raw in &positions {
            let snapshot = match PositionSnapshot::from_record(raw) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable position record");
                    continue;
                }
            };
            if snapshot.quantity == 0.0 {
                continue;
            }
            active_keys.insert(snapshot.key());
            active.push(snapshot);
        }

        self.evict_inactive(&active_keys);

        if active.is_empty() {
            debug!("No active positions; nothing to check");
            return;
        }

        debug!(count = active.len(), "Checking positions for trailing stop updates");

        let mut updated = 0usize;
        let mut skipped = 0usize;
        for snapshot in &active {
            match self.process_snapshot(snapshot).await {
                Outcome::Updated => updated += 1,
                Outcome::Skipped => skipped += 1,
                Outcome::Failed => {}
            }
        }

        info!(
            checked = active.len(),
            updated, skipped, "Trailing stop sweep complete"
        );
    }

    fn evict_inactive(&self, active_keys: &HashSet<String>) {
        for evicted in self.registry.cleanup(active_keys) {
            info!(
                position = %evicted.key,
                initial_stop = evicted.initial_stop,
                "Evicted risk state for closed position"
            );
        }
    }

    async fn process_snapshot(&self, pos: &PositionSnapshot) -> Outcome {
        let key = pos.key();

        let Some(risk) = self.registry.snapshot(&key) else {
            debug!(position = %key, "No initial stop registered; skipping");
            return Outcome::Skipped;
        };

        let risk_distance = (pos.entry_price - risk.initial_stop).abs();
        if risk_distance == 0.0 {
            warn!(
                position = %key,
                entry = pos.entry_price,
                initial_stop = risk.initial_stop,
                "Entry price equals initial stop; cannot derive 1R, skipping"
            );
            return Outcome::Skipped;
        }

        let current_r = current_r_multiple(pos.side, pos.entry_price, pos.mark_price, risk_distance);
        self.registry
            .update_peak_and_max_r(&key, pos.side, pos.mark_price, current_r);
        let risk = self.registry.snapshot(&key).unwrap_or(risk);

        debug!(
            position = %key,
            initial_stop = risk.initial_stop,
            risk_distance,
            current_r,
            max_r = risk.max_r,
            "Risk state"
        );

        // base stop precedence: live exchange stop, then recorded, then initial
        let mut prev_stop: Option<f64> = None;
        match self.current_stop_order(&pos.symbol, pos.side).await {
            Ok(Some(stop)) => {
                prev_stop = Some(stop);
                self.registry.record_stop(&key, stop);
                debug!(position = %key, stop, "Exchange holds a live stop order");
            }
            Ok(None) => {
                debug!(position = %key, "No stop order on exchange");
            }
            Err(e) => {
                warn!(
                    position = %key,
                    error = %e,
                    "Failed to query live stop; falling back to recorded value"
                );
            }
        }
        if prev_stop.is_none() {
            prev_stop = risk.last_recorded_stop.filter(|stop| *stop > 0.0);
        }

        let view = RiskView {
            initial_stop: risk.initial_stop,
            peak_price: risk.peak_price,
            max_r: risk.max_r,
            opened_at: Some(risk.opened_at),
        };
        let decision = match self.calculator.calculate(pos, &view, prev_stop).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(position = %key, error = %e, "Trailing stop calculation failed; skipping");
                return Outcome::Skipped;
            }
        };

        let allow_initial_stop =
            prev_stop.is_none() && approx_eq(decision.stop, risk.initial_stop);
        let validity = validate_stop(
            pos.side,
            pos.entry_price,
            decision.stop,
            pos.mark_price,
            allow_initial_stop,
        );

        // a stop at or through the mark overrides everything else
        if validity == StopValidity::WouldTrigger {
            warn!(
                position = %key,
                stop = decision.stop,
                mark = pos.mark_price,
                "Mark already through the new stop; closing at market"
            );
            return match self.emergency_close(pos).await {
                Ok(()) => Outcome::Updated,
                Err(e) => {
                    error!(position = %key, error = %e, "Emergency close failed");
                    Outcome::Failed
                }
            };
        }

        if let Some(prev) = prev_stop {
            if approx_eq(decision.stop, prev) {
                debug!(position = %key, stop = decision.stop, "Stop unchanged; nothing to submit");
                return Outcome::Skipped;
            }
        }

        if validity == StopValidity::Rejected {
            warn!(
                position = %key,
                stop = decision.stop,
                entry = pos.entry_price,
                "New stop rejected by validation; skipping"
            );
            return Outcome::Skipped;
        }

        debug!(position = %key, reason = %decision.reason, "Trailing stop computed");

        match self
            .submit_stop_update(pos, &key, decision.stop, &decision.reason, prev_stop)
            .await
        {
            Ok(true) => Outcome::Updated,
            Ok(false) => Outcome::Skipped,
            Err(e) => {
                error!(position = %key, error = %e, "Stop update failed");
                Outcome::Failed
            }
        }
    }

    /// Place the tightened stop, unless the price got there first or the
    /// exchange already holds an equal-or-better one.
    async fn submit_stop_update(
        &self,
        pos: &PositionSnapshot,
        key: &str,
        new_stop: f64,
        reason: &str,
        existing_stop: Option<f64>,
    ) -> Result<bool, AdapterError> {
        // the mark may have crossed the stop since it was computed
        let triggered = match pos.side {
            PositionSide::Long => pos.mark_price <= new_stop,
            PositionSide::Short => pos.mark_price >= new_stop,
        };
        if triggered {
            warn!(
                position = %key,
                stop = new_stop,
                mark = pos.mark_price,
                "Stop level already reached; executing market close instead"
            );
            self.emergency_close(pos).await?;
            return Ok(true);
        }

        let mut current = existing_stop;
        if current.is_none() {
            match self.current_stop_order(&pos.symbol, pos.side).await {
                Ok(found) => current = found,
                Err(e) => {
                    warn!(
                        position = %key,
                        error = %e,
                        "Failed to refresh live stop; proceeding with update"
                    );
                }
            }
        }

        if let Some(current) = current {
            let improved = match pos.side {
                PositionSide::Long => new_stop > current,
                PositionSide::Short => new_stop < current,
            };
            if !improved {
                debug!(
                    position = %key,
                    new_stop,
                    current,
                    "New stop does not improve on the exchange stop; skipping"
                );
                return Ok(false);
            }
            info!(position = %key, from = current, to = new_stop, "Tightening stop");
        } else {
            info!(
                position = %key,
                stop = new_stop,
                "No stop order on exchange; treating as first placement"
            );
        }

        let reasoning = if reason.is_empty() {
            format!("trailing stop adjusted to {:.4}", new_stop)
        } else {
            reason.to_string()
        };
        let decision = StopLossDecision::update_stop_loss(&pos.symbol, new_stop, reasoning);
        let action = DecisionAction {
            action: "update_stop_loss".to_string(),
            symbol: pos.symbol.clone(),
            quantity: 0.0,
            leverage: 0,
            price: pos.mark_price,
            order_id: None,
            timestamp: Utc::now(),
            success: false,
        };

        let owner = self.owner();
        owner.execute_stop_loss(&decision, &action).await?;

        self.registry.record_stop(key, new_stop);
        info!(position = %key, stop = new_stop, "Trailing stop submitted");
        Ok(true)
    }

    /// The most conservative reduce-only stop currently on the exchange.
    async fn current_stop_order(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<f64>, AdapterError> {
        let client = self.owner().trading_client();
        let orders = client.get_open_orders(symbol).await?;
        Ok(select_stop_from_orders(&orders, side))
    }

    /// Close the position at market, drop its risk state, and record a
    /// synthetic emergency-close decision.
    async fn emergency_close(&self, pos: &PositionSnapshot) -> Result<(), AdapterError> {
        let owner = self.owner();
        let client = owner.trading_client();

        info!(
            symbol = %pos.symbol,
            side = %pos.side,
            mark = pos.mark_price,
            "Executing emergency market close"
        );

        let order = match pos.side {
            PositionSide::Long => client.close_long(&pos.symbol, 0.0).await?,
            PositionSide::Short => client.close_short(&pos.symbol, 0.0).await?,
        };

        self.clear_position(&pos.symbol, pos.side);

        let order_id = order.get("orderId").and_then(Value::as_i64);
        let action = DecisionAction {
            action: format!("emergency_close_{}", pos.side),
            symbol: pos.symbol.clone(),
            quantity: 0.0,
            leverage: 0,
            price: pos.mark_price,
            order_id,
            timestamp: Utc::now(),
            success: true,
        };
        let record = DecisionRecord::new(
            vec![format!(
                "trailing stop triggered emergency close: {} {}",
                pos.symbol, pos.side
            )],
            true,
            vec![action],
        );

        if let Some(recorder) = owner.decision_recorder() {
            if let Err(e) = recorder.log_decision(&record).await {
                warn!(error = %e, "Failed to persist emergency close record");
            }
        }

        info!(symbol = %pos.symbol, side = %pos.side, "Emergency close complete");
        Ok(())
    }
}

#[async_trait]
impl Monitor for TrailingStopMonitor {
    fn start(self: Arc<Self>) {
        let mut state = self.run_state.lock().expect("run state lock poisoned");
        if state.running {
            warn!("Trailing stop monitor already running; start skipped");
            return;
        }
        let (tx, rx) = watch::channel(false);
        state.running = true;
        state.shutdown = Some(tx);
        let monitor = Arc::clone(&self);
        state.handle = Some(tokio::spawn(async move { monitor.run(rx).await }));
    }

    async fn stop(&self) {
        let (shutdown, handle) = {
            let mut state = self.run_state.lock().expect("run state lock poisoned");
            if !state.running {
                debug!("Trailing stop monitor not running; stop skipped");
                return;
            }
            state.running = false;
            (state.shutdown.take(), state.handle.take())
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Trailing stop monitor stopped");
    }

    fn set_owner(&self, owner: Arc<dyn Owner>) {
        *self.owner.write().expect("owner lock poisoned") = owner;
    }

    fn clear_position(&self, symbol: &str, side: PositionSide) {
        if let Some(initial_stop) = self.registry.clear(symbol, side) {
            info!(
                position = %position_key(symbol, side),
                initial_stop,
                "Cleared risk state"
            );
        }
    }

    fn register_initial_stop(&self, symbol: &str, side: PositionSide, stop: f64) {
        if symbol.is_empty() || stop <= 0.0 {
            warn!(symbol, side = %side, stop, "Ignoring invalid initial stop registration");
            return;
        }
        let key = self.registry.register_initial_stop(symbol, side, stop);
        info!(position = %key, stop, "Registered initial stop");
    }
}
