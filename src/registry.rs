//! Risk State Registry
//!
//! Thread-safe per-position risk state: the initial stop registered on entry,
//! the favorable price extreme, the highest R multiple seen, and the last
//! stop successfully written to the exchange. The monitor mutates the state
//! on its tick; callers register and clear positions from their own threads.
//!
//! State lives in memory only. A restart rebuilds from the exchange's current
//! stop orders and the next registered initial stop.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

use crate::types::{position_key, PositionSide};

/// Mutable risk state for one position key.
#[derive(Debug, Clone)]
pub struct RiskState {
    /// Stop registered when the position opened; defines the 1R distance
    pub initial_stop: f64,
    /// Favorable price extreme seen so far (`None` until the first tick)
    pub peak_price: Option<f64>,
    /// Highest R multiple ever observed on this position
    pub max_r: f64,
    /// Last stop successfully written to the exchange
    pub last_recorded_stop: Option<f64>,
    /// When the initial stop was registered
    pub opened_at: Instant,
}

/// A state dropped by the reconciliation sweep, for logging.
#[derive(Debug, Clone)]
pub struct EvictedState {
    pub key: String,
    pub initial_stop: f64,
}

/// Registry of risk states keyed by `symbol_side`.
#[derive(Default)]
pub struct RiskRegistry {
    states: RwLock<HashMap<String, RiskState>>,
}

impl RiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the initial stop for a position, keyed by symbol + side.
    /// Returns the position key.
    pub fn register_initial_stop(
        &self,
        symbol: &str,
        side: PositionSide,
        stop: f64,
    ) -> String {
        let key = position_key(symbol, side);
        let mut states = self.states.write().expect("risk registry lock poisoned");
        states.insert(
            key.clone(),
            RiskState {
                initial_stop: stop,
                peak_price: None,
                max_r: 0.0,
                last_recorded_stop: None,
                opened_at: Instant::now(),
            },
        );
        key
    }

    /// Clone out the state for a key, if present.
    pub fn snapshot(&self, key: &str) -> Option<RiskState> {
        let states = self.states.read().expect("risk registry lock poisoned");
        states.get(key).cloned()
    }

    /// Record a stop successfully written to the exchange.
    /// Non-positive values are ignored.
    pub fn record_stop(&self, key: &str, stop: f64) {
        if stop <= 0.0 {
            return;
        }
        let mut states = self.states.write().expect("risk registry lock poisoned");
        if let Some(state) = states.get_mut(key) {
            state.last_recorded_stop = Some(stop);
        }
    }

    /// Fold the latest mark price and R multiple into the state.
    ///
    /// The peak only moves in the favorable direction and `max_r` never
    /// decreases, whatever the inputs.
    pub fn update_peak_and_max_r(
        &self,
        key: &str,
        side: PositionSide,
        mark_price: f64,
        current_r: f64,
    ) {
        let mut states = self.states.write().expect("risk registry lock poisoned");
        let Some(state) = states.get_mut(key) else {
            return;
        };

        state.peak_price = Some(match (state.peak_price, side) {
            (None, _) => mark_price,
            (Some(peak), PositionSide::Long) => peak.max(mark_price),
            (Some(peak), PositionSide::Short) => peak.min(mark_price),
        });

        if current_r > state.max_r {
            state.max_r = current_r;
        }
    }

    /// Drop every state whose key is absent from `active_keys`.
    ///
    /// An empty active set clears the registry. Returns the evicted entries
    /// so the caller can log them.
    pub fn cleanup(&self, active_keys: &HashSet<String>) -> Vec<EvictedState> {
        let mut states = self.states.write().expect("risk registry lock poisoned");
        let mut removed = Vec::new();
        states.retain(|key, state| {
            if active_keys.contains(key) {
                true
            } else {
                removed.push(EvictedState {
                    key: key.clone(),
                    initial_stop: state.initial_stop,
                });
                false
            }
        });
        removed
    }

    /// Remove a single position's state, returning its initial stop.
    pub fn clear(&self, symbol: &str, side: PositionSide) -> Option<f64> {
        let key = position_key(symbol, side);
        let mut states = self.states.write().expect("risk registry lock poisoned");
        states.remove(&key).map(|state| state.initial_stop)
    }

    pub fn len(&self) -> usize {
        self.states.read().expect("risk registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_snapshot() {
        let registry = RiskRegistry::new();
        let key = registry.register_initial_stop("BTCUSDT", PositionSide::Long, 98.0);
        assert_eq!(key, "BTCUSDT_long");

        let state = registry.snapshot(&key).unwrap();
        assert_eq!(state.initial_stop, 98.0);
        assert_eq!(state.peak_price, None);
        assert_eq!(state.max_r, 0.0);
        assert_eq!(state.last_recorded_stop, None);
    }

    #[test]
    fn test_peak_is_monotonic_long() {
        let registry = RiskRegistry::new();
        let key = registry.register_initial_stop("BTCUSDT", PositionSide::Long, 98.0);

        registry.update_peak_and_max_r(&key, PositionSide::Long, 100.5, 0.25);
        assert_eq!(registry.snapshot(&key).unwrap().peak_price, Some(100.5));

        registry.update_peak_and_max_r(&key, PositionSide::Long, 103.0, 1.5);
        assert_eq!(registry.snapshot(&key).unwrap().peak_price, Some(103.0));

        // pullback must not lower the peak
        registry.update_peak_and_max_r(&key, PositionSide::Long, 102.5, 1.25);
        let state = registry.snapshot(&key).unwrap();
        assert_eq!(state.peak_price, Some(103.0));
        assert_eq!(state.max_r, 1.5);
    }

    #[test]
    fn test_peak_is_monotonic_short() {
        let registry = RiskRegistry::new();
        let key = registry.register_initial_stop("SOLUSDT", PositionSide::Short, 21.0);

        registry.update_peak_and_max_r(&key, PositionSide::Short, 19.0, 1.0);
        registry.update_peak_and_max_r(&key, PositionSide::Short, 18.0, 2.0);
        registry.update_peak_and_max_r(&key, PositionSide::Short, 18.5, 1.5);

        let state = registry.snapshot(&key).unwrap();
        assert_eq!(state.peak_price, Some(18.0));
        assert_eq!(state.max_r, 2.0);
    }

    #[test]
    fn test_record_stop_ignores_non_positive() {
        let registry = RiskRegistry::new();
        let key = registry.register_initial_stop("BTCUSDT", PositionSide::Long, 98.0);

        registry.record_stop(&key, 0.0);
        assert_eq!(registry.snapshot(&key).unwrap().last_recorded_stop, None);

        registry.record_stop(&key, 100.45);
        assert_eq!(
            registry.snapshot(&key).unwrap().last_recorded_stop,
            Some(100.45)
        );

        // unknown keys are a no-op
        registry.record_stop("ETHUSDT_long", 50.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cleanup_drops_inactive_keys() {
        let registry = RiskRegistry::new();
        registry.register_initial_stop("AAAUSDT", PositionSide::Long, 10.0);
        registry.register_initial_stop("BBBUSDT", PositionSide::Short, 20.0);

        let active: HashSet<String> = ["AAAUSDT_long".to_string()].into_iter().collect();
        let removed = registry.cleanup(&active);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "BBBUSDT_short");
        assert_eq!(removed[0].initial_stop, 20.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cleanup_with_empty_set_clears_all() {
        let registry = RiskRegistry::new();
        registry.register_initial_stop("AAAUSDT", PositionSide::Long, 10.0);
        registry.register_initial_stop("BBBUSDT", PositionSide::Short, 20.0);

        let removed = registry.cleanup(&HashSet::new());
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_returns_initial_stop() {
        let registry = RiskRegistry::new();
        registry.register_initial_stop("BTCUSDT", PositionSide::Long, 98.0);

        assert_eq!(registry.clear("BTCUSDT", PositionSide::Long), Some(98.0));
        assert_eq!(registry.clear("BTCUSDT", PositionSide::Long), None);
    }
}
