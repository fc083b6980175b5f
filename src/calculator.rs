//! Trailing Stop Calculator
//!
//! The per-position state machine. Given a snapshot, the registered risk
//! state, and the previous stop, it produces the next stop price together
//! with a human readable explanation. Pure aside from the ATR fetch.
//!
//! Behavior is derived from the continuous R multiple and the configured
//! band list; no discrete phase is stored anywhere:
//!
//! - below the breakeven threshold the stop is held, except for the T+2
//!   stall rule which locks in a share of the peak R after a configured
//!   time in trade;
//! - at or above the threshold the stop is the tightest of the previous
//!   stop, the R-lock floor (S1), and the ATR trail from the favorable
//!   extreme (S2). The stop never loosens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::atr::{AtrError, AtrSource};
use crate::config::{AssetProfile, TrailingConfig};
use crate::snapshot::PositionSnapshot;
use crate::types::{approx_eq, PositionSide};

/// Lightweight view of the risk state needed to compute the trailing stop.
#[derive(Debug, Clone)]
pub struct RiskView {
    pub initial_stop: f64,
    pub peak_price: Option<f64>,
    pub max_r: f64,
    pub opened_at: Option<Instant>,
}

/// Outcome of one calculation.
#[derive(Debug, Clone)]
pub struct TrailingDecision {
    /// The next stop price (never looser than the base stop)
    pub stop: f64,
    /// Set when the T+2 reversion stop is already at or through the mark.
    /// The monitor decides emergency closes on its validation step; this
    /// flag is informational.
    pub force_exit: bool,
    /// Explanation of how the stop was derived, for logs and decisions
    pub reason: String,
}

/// Error type for trailing stop calculation.
#[derive(Debug, Error)]
pub enum CalculatorError {
    #[error("risk distance is zero: entry {entry} equals initial stop {initial_stop}")]
    ZeroRiskDistance { entry: f64, initial_stop: f64 },

    #[error(transparent)]
    Atr(#[from] AtrError),
}

/// ATR-based trailing stop rules over a resolved configuration.
pub struct TrailingCalculator {
    atr: Arc<dyn AtrSource>,
    config: TrailingConfig,
}

impl TrailingCalculator {
    /// Calculator with the built-in default configuration.
    pub fn new(atr: Arc<dyn AtrSource>) -> Self {
        Self::with_config(atr, None)
    }

    /// Calculator with caller overrides merged onto the defaults.
    pub fn with_config(atr: Arc<dyn AtrSource>, overrides: Option<&TrailingConfig>) -> Self {
        Self {
            atr,
            config: TrailingConfig::resolve(overrides),
        }
    }

    pub fn config(&self) -> &TrailingConfig {
        &self.config
    }

    /// Compute the next stop for a position.
    ///
    /// `prev_stop` is the stop currently in force (exchange order or last
    /// recorded value); `None` means no stop has been seen yet and the
    /// registered initial stop is the base.
    pub async fn calculate(
        &self,
        pos: &PositionSnapshot,
        risk: &RiskView,
        prev_stop: Option<f64>,
    ) -> Result<TrailingDecision, CalculatorError> {
        let entry = pos.entry_price;
        let mark = pos.mark_price;

        let risk_distance = (entry - risk.initial_stop).abs();
        if risk_distance <= 0.0 {
            return Err(CalculatorError::ZeroRiskDistance {
                entry,
                initial_stop: risk.initial_stop,
            });
        }

        let current_r = current_r_multiple(pos.side, entry, mark, risk_distance);
        let base_stop = prev_stop.unwrap_or(risk.initial_stop);

        let class = self.config.asset_class_for(&pos.symbol);
        let phase_start = self.config.phase_start_breakeven_for(class);

        if current_r < phase_start {
            return Ok(self.hold_or_stall(
                pos.side,
                risk,
                base_stop,
                current_r,
                entry,
                mark,
                risk_distance,
                class,
                phase_start,
            ));
        }

        let period = self.config.atr_period_for(class);
        let interval = self.config.atr_interval_for(class);
        let atr = self.atr.fetch_atr(&pos.symbol, interval, period).await?;
        if atr <= 0.0 {
            return Err(AtrError::Unavailable { interval, period }.into());
        }

        let regime_vol = atr / mark;
        let params = self.config.trailing_params(class, current_r);
        let atr_mult = self
            .config
            .adjust_atr_multiplier(class, params.base_atr_multiplier, regime_vol);

        // S1: floor the stop at the locked share of the current R
        let min_locked = self.config.min_locked_r_for(class);
        let mut locked_r = (current_r * params.lock_ratio).max(min_locked);
        let mut alpha_lock = 0.0;
        if let Some(profile) = self.config.profile_for(class) {
            if profile.max_r_lock_alpha > 0.0 && risk.max_r > 0.0 {
                alpha_lock = (risk.max_r * profile.max_r_lock_alpha).min(current_r);
                if alpha_lock > locked_r {
                    locked_r = alpha_lock;
                }
            }
        }

        // S2: ATR trail from the favorable extreme
        let peak = risk
            .peak_price
            .filter(|p| *p > 0.0)
            .unwrap_or(mark);

        let (s1, s2, candidate) = match pos.side {
            PositionSide::Long => {
                let s1 = (entry + locked_r * risk_distance).max(entry);
                let s2 = peak - atr * atr_mult;
                (s1, s2, base_stop.max(s1.max(s2)))
            }
            PositionSide::Short => {
                let s1 = (entry - locked_r * risk_distance).min(entry);
                let s2 = peak + atr * atr_mult;
                (s1, s2, base_stop.min(s1.min(s2)))
            }
        };

        let new_stop = tighten(pos.side, base_stop, candidate);
        let held = if approx_eq(new_stop, base_stop) {
            " (held)"
        } else {
            ""
        };
        let reason = format!(
            "{}: regime_vol={:.4}, locked_r={:.2}R (max_r={:.2}R, alpha={:.2}R), \
             ATR({},{})={:.4}x{:.2} -> s1={:.4}, s2={:.4}, stop={:.4}{}",
            params.label,
            regime_vol,
            locked_r,
            risk.max_r,
            alpha_lock,
            interval,
            period,
            atr,
            atr_mult,
            s1,
            s2,
            new_stop,
            held,
        );

        Ok(TrailingDecision {
            stop: new_stop,
            force_exit: false,
            reason,
        })
    }

    /// Phase 0: hold the base stop, unless the T+2 stall rule engages.
    #[allow(clippy::too_many_arguments)]
    fn hold_or_stall(
        &self,
        side: PositionSide,
        risk: &RiskView,
        base_stop: f64,
        current_r: f64,
        entry: f64,
        mark: f64,
        risk_distance: f64,
        class: &str,
        phase_start: f64,
    ) -> TrailingDecision {
        let stage_one_max = stage_one_max_r(self.config.profile_for(class));
        let lock_ratio = self.config.t_plus_two_lock_ratio_for(class);
        let duration = self.config.t_plus_two_duration_for(class);

        if let Some(stall_stop) = t_plus_two_stop(
            side,
            risk,
            stage_one_max,
            current_r,
            entry,
            risk_distance,
            lock_ratio,
            duration,
        ) {
            let force_exit = match side {
                PositionSide::Long => stall_stop >= mark,
                PositionSide::Short => stall_stop <= mark,
            };
            let new_stop = tighten(side, base_stop, stall_stop);
            let mut reason = format!(
                "phase 0: {:.2}R < {:.2}R, T+2 reversion lock at {:.4}, stop={:.4}",
                current_r, phase_start, stall_stop, new_stop,
            );
            if approx_eq(new_stop, base_stop) {
                reason.push_str(" (held)");
            }
            if force_exit {
                reason.push_str(" (force exit)");
            }
            return TrailingDecision {
                stop: new_stop,
                force_exit,
                reason,
            };
        }

        TrailingDecision {
            stop: base_stop,
            force_exit: false,
            reason: format!(
                "phase 0: {:.2}R below breakeven threshold {:.2}R, holding stop {:.4}",
                current_r, phase_start, base_stop,
            ),
        }
    }
}

/// Position P&L in units of the initial risk distance.
pub fn current_r_multiple(side: PositionSide, entry: f64, mark: f64, risk_distance: f64) -> f64 {
    match side {
        PositionSide::Long => (mark - entry) / risk_distance,
        PositionSide::Short => (entry - mark) / risk_distance,
    }
}

/// Move `current` toward `candidate` only in the tightening direction.
fn tighten(side: PositionSide, current: f64, candidate: f64) -> f64 {
    match side {
        PositionSide::Long => current.max(candidate),
        PositionSide::Short => current.min(candidate),
    }
}

fn stage_one_max_r(profile: Option<&AssetProfile>) -> f64 {
    let Some(profile) = profile else {
        return 0.0;
    };
    match profile.ranges.first() {
        Some(band) if band.max_r > 0.0 => band.max_r,
        _ => 0.0,
    }
}

/// Reversion stop for a position that ran up and then stalled below the
/// trailing phase. `None` when the rule does not apply.
#[allow(clippy::too_many_arguments)]
fn t_plus_two_stop(
    side: PositionSide,
    risk: &RiskView,
    stage_one_max: f64,
    current_r: f64,
    entry: f64,
    risk_distance: f64,
    lock_ratio: f64,
    duration: Duration,
) -> Option<f64> {
    if lock_ratio <= 0.0 || duration.is_zero() {
        return None;
    }
    let opened_at = risk.opened_at?;
    if stage_one_max <= 0.0 || risk.max_r <= 0.0 {
        return None;
    }
    if current_r <= 0.0 || current_r >= stage_one_max {
        return None;
    }
    if opened_at.elapsed() < duration {
        return None;
    }

    let target_r = risk.max_r * lock_ratio;
    // never cross entry into loss
    let stop = match side {
        PositionSide::Long => (entry + target_r * risk_distance).max(entry),
        PositionSide::Short => (entry - target_r * risk_distance).min(entry),
    };
    Some(stop)
}
