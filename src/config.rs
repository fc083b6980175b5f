//! Trailing-Stop Configuration
//!
//! All tunable parameters that govern how the trailing stop behaves, keyed by
//! asset class. Symbols resolve to a class through ordered prefix rules; each
//! class carries a tiered profile of R-bands, an ATR period/interval, regime
//! volatility adjustments, and the T+2 stall rule. Caller overrides merge
//! onto the built-in defaults field by field: positive / non-empty values
//! shadow, zero / empty values inherit.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AtrInterval;

/// Associates a symbol prefix with an asset class key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetClassRule {
    /// Symbol prefix to match (case-insensitive)
    pub prefix: String,
    /// Asset class identifier
    pub class: String,
}

/// How ATR multipliers react to volatility regimes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegimeAdjustment {
    /// Regime volatility below this triggers `low_multiplier`
    pub low_threshold: f64,
    /// Scale applied to the ATR multiplier in quiet regimes
    pub low_multiplier: f64,
    /// Regime volatility above this triggers `high_multiplier`
    pub high_threshold: f64,
    /// Scale applied to the ATR multiplier in wild regimes
    pub high_multiplier: f64,
}

/// How much R to lock and which ATR multiplier to use within one R-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingBand {
    /// Upper R bound of this band; 0 means unbounded (final band)
    pub max_r: f64,
    /// Share of the current R to lock in
    pub lock_ratio: f64,
    /// Base ATR multiplier for the trail distance
    pub base_atr_multiplier: f64,
    /// Human-readable description for logs
    pub label: String,
}

impl TrailingBand {
    pub fn new(max_r: f64, lock_ratio: f64, base_atr_multiplier: f64, label: &str) -> Self {
        Self {
            max_r,
            lock_ratio,
            base_atr_multiplier,
            label: label.to_string(),
        }
    }
}

/// Trailing behavior for a single asset class.
///
/// Zero / `None` fields inherit the global configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetProfile {
    /// Ordered R-bands; the first matching band wins
    pub ranges: Vec<TrailingBand>,
    /// Volatility-regime multiplier adjustment
    pub regime_adjustment: RegimeAdjustment,
    /// ATR period override for this class
    pub atr_period: usize,
    /// ATR interval override for this class
    pub atr_interval: Option<AtrInterval>,
    /// Share of the peak R that must stay locked, capping profit give-back
    pub max_r_lock_alpha: f64,
    /// Minimum R multiple before the trailing phase starts
    pub phase_start_breakeven: f64,
    /// Floor on the locked R once trailing
    pub min_locked_r: f64,
    /// Time in trade after which the stall rule engages
    pub t_plus_two_duration: Duration,
    /// Share of the peak R the stall rule locks
    pub t_plus_two_lock_ratio: f64,
}

/// Resolved band parameters for one `(class, current_r)` lookup.
#[derive(Debug, Clone)]
pub struct BandParams {
    pub lock_ratio: f64,
    pub base_atr_multiplier: f64,
    pub label: String,
}

/// Complete trailing-stop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Default ATR period (klines)
    pub atr_period: usize,
    /// Default kline interval for ATR
    pub atr_interval: Option<AtrInterval>,
    /// Minimum R multiple before the trailing phase starts
    pub phase_start_breakeven: f64,
    /// Asset class used when no prefix rule matches
    pub default_asset_class: String,
    /// Default floor on the locked R once trailing
    pub default_min_locked_r: f64,
    /// Default time in trade before the stall rule engages; zero disables
    pub t_plus_two_duration: Duration,
    /// Default share of the peak R the stall rule locks; zero disables
    pub t_plus_two_lock_ratio: f64,
    /// Ordered symbol-prefix rules; first match wins
    pub asset_class_rules: Vec<AssetClassRule>,
    /// Per-class profiles
    pub asset_profiles: HashMap<String, AssetProfile>,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        let mut asset_profiles = HashMap::new();

        asset_profiles.insert(
            "btc".to_string(),
            AssetProfile {
                // the 1h default of 14 bars lags for BTC; 10 tracks better
                atr_period: 10,
                ranges: vec![
                    TrailingBand::new(1.2, 0.10, 3.0, "btc cost protection"),
                    TrailingBand::new(2.5, 0.60, 2.0, "btc profit harvest"),
                    TrailingBand::new(0.0, 0.80, 1.5, "btc blow-off top"),
                ],
                regime_adjustment: RegimeAdjustment {
                    low_threshold: 0.005,
                    low_multiplier: 1.0,
                    high_threshold: 0.020,
                    high_multiplier: 1.1,
                },
                max_r_lock_alpha: 0.60,
                ..AssetProfile::default()
            },
        );

        asset_profiles.insert(
            "trend_alt".to_string(),
            AssetProfile {
                atr_period: 7,
                // alts start trailing earlier to limit give-back
                phase_start_breakeven: 0.8,
                ranges: vec![
                    TrailingBand::new(1.5, 0.10, 3.5, "fast breakeven"),
                    TrailingBand::new(3.0, 0.50, 2.5, "lock half"),
                    TrailingBand::new(5.0, 0.70, 1.8, "acceleration"),
                    TrailingBand::new(0.0, 0.85, 1.5, "bank it"),
                ],
                regime_adjustment: RegimeAdjustment {
                    low_threshold: 0.02,
                    low_multiplier: 0.8,
                    high_threshold: 0.08,
                    high_multiplier: 1.2,
                },
                max_r_lock_alpha: 0.60,
                ..AssetProfile::default()
            },
        );

        Self {
            atr_period: 14,
            atr_interval: Some(AtrInterval::OneHour),
            phase_start_breakeven: 1.0,
            default_asset_class: "trend_alt".to_string(),
            default_min_locked_r: 0.1,
            t_plus_two_duration: Duration::from_secs(48 * 3600),
            t_plus_two_lock_ratio: 0.5,
            asset_class_rules: vec![AssetClassRule {
                prefix: "BTC".to_string(),
                class: "btc".to_string(),
            }],
            asset_profiles,
        }
    }
}

impl TrailingConfig {
    /// Merge caller overrides onto the built-in defaults.
    ///
    /// Positive / non-empty fields shadow the defaults; zero / empty fields
    /// inherit. Caller profiles replace default profiles by class key.
    pub fn resolve(overrides: Option<&TrailingConfig>) -> TrailingConfig {
        let mut base = TrailingConfig::default();
        let Some(cfg) = overrides else {
            return base;
        };

        if cfg.atr_period > 0 {
            base.atr_period = cfg.atr_period;
        }
        if cfg.atr_interval.is_some() {
            base.atr_interval = cfg.atr_interval;
        }
        if cfg.phase_start_breakeven > 0.0 {
            base.phase_start_breakeven = cfg.phase_start_breakeven;
        }
        if !cfg.default_asset_class.is_empty() {
            base.default_asset_class = cfg.default_asset_class.clone();
        }
        if cfg.default_min_locked_r > 0.0 {
            base.default_min_locked_r = cfg.default_min_locked_r;
        }
        if !cfg.t_plus_two_duration.is_zero() {
            base.t_plus_two_duration = cfg.t_plus_two_duration;
        }
        if cfg.t_plus_two_lock_ratio > 0.0 {
            base.t_plus_two_lock_ratio = cfg.t_plus_two_lock_ratio;
        }
        if !cfg.asset_class_rules.is_empty() {
            base.asset_class_rules = cfg.asset_class_rules.clone();
        }
        for (class, profile) in &cfg.asset_profiles {
            base.asset_profiles.insert(class.clone(), profile.clone());
        }

        base
    }

    /// Resolve a symbol to its asset class via the ordered prefix rules.
    pub fn asset_class_for(&self, symbol: &str) -> &str {
        let normalized = symbol.trim().to_uppercase();
        for rule in &self.asset_class_rules {
            if rule.prefix.is_empty() {
                continue;
            }
            if normalized.starts_with(&rule.prefix.to_uppercase()) {
                return &rule.class;
            }
        }
        &self.default_asset_class
    }

    /// Profile for a class, falling back to the default class, then any.
    pub fn profile_for(&self, class: &str) -> Option<&AssetProfile> {
        self.asset_profiles
            .get(class)
            .or_else(|| self.asset_profiles.get(&self.default_asset_class))
            .or_else(|| self.asset_profiles.values().next())
    }

    /// Band parameters for the current R multiple.
    ///
    /// Walks the band list in order; the first band that is unbounded
    /// (`max_r == 0`) or has `current_r` below its bound wins. When the R
    /// exceeds every bounded band, the last band applies.
    pub fn trailing_params(&self, class: &str, current_r: f64) -> BandParams {
        let Some(profile) = self.profile_for(class).filter(|p| !p.ranges.is_empty()) else {
            return BandParams {
                lock_ratio: 0.30,
                base_atr_multiplier: 3.0,
                label: "default trailing band".to_string(),
            };
        };

        for band in &profile.ranges {
            if band.max_r == 0.0 || current_r < band.max_r {
                return BandParams {
                    lock_ratio: band.lock_ratio,
                    base_atr_multiplier: band.base_atr_multiplier,
                    label: band.label.clone(),
                };
            }
        }

        let last = &profile.ranges[profile.ranges.len() - 1];
        BandParams {
            lock_ratio: last.lock_ratio,
            base_atr_multiplier: last.base_atr_multiplier,
            label: last.label.clone(),
        }
    }

    /// Scale the base ATR multiplier for the current volatility regime.
    pub fn adjust_atr_multiplier(&self, class: &str, base: f64, regime_vol: f64) -> f64 {
        let Some(profile) = self.profile_for(class) else {
            return base;
        };
        if regime_vol <= 0.0 {
            return base;
        }
        let adj = profile.regime_adjustment;
        if adj.low_threshold > 0.0 && adj.low_multiplier > 0.0 && regime_vol < adj.low_threshold {
            return base * adj.low_multiplier;
        }
        if adj.high_threshold > 0.0 && adj.high_multiplier > 0.0 && regime_vol > adj.high_threshold
        {
            return base * adj.high_multiplier;
        }
        base
    }

    pub fn atr_period_for(&self, class: &str) -> usize {
        match self.profile_for(class) {
            Some(profile) if profile.atr_period > 0 => profile.atr_period,
            _ => self.atr_period,
        }
    }

    pub fn atr_interval_for(&self, class: &str) -> AtrInterval {
        self.profile_for(class)
            .and_then(|profile| profile.atr_interval)
            .or(self.atr_interval)
            .unwrap_or(AtrInterval::OneHour)
    }

    pub fn phase_start_breakeven_for(&self, class: &str) -> f64 {
        match self.profile_for(class) {
            Some(profile) if profile.phase_start_breakeven > 0.0 => profile.phase_start_breakeven,
            _ => self.phase_start_breakeven,
        }
    }

    pub fn min_locked_r_for(&self, class: &str) -> f64 {
        match self.profile_for(class) {
            Some(profile) if profile.min_locked_r > 0.0 => profile.min_locked_r,
            _ => self.default_min_locked_r,
        }
    }

    pub fn t_plus_two_duration_for(&self, class: &str) -> Duration {
        match self.profile_for(class) {
            Some(profile) if !profile.t_plus_two_duration.is_zero() => {
                profile.t_plus_two_duration
            }
            _ => self.t_plus_two_duration,
        }
    }

    pub fn t_plus_two_lock_ratio_for(&self, class: &str) -> f64 {
        match self.profile_for(class) {
            Some(profile) if profile.t_plus_two_lock_ratio > 0.0 => profile.t_plus_two_lock_ratio,
            _ => self.t_plus_two_lock_ratio,
        }
    }
}
