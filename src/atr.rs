//! Average True Range
//!
//! Wilder-smoothed ATR over a kline series, plus the pluggable fetcher the
//! trailing calculator consumes. A [`KlineAtrSource`] computes ATR from any
//! [`KlineSource`]; tests and hosts with their own indicator cache can
//! implement [`AtrSource`] directly.

use async_trait::async_trait;
use thiserror::Error;

use crate::adapter::{AdapterError, KlineSource};
use crate::types::{AtrInterval, Kline};

/// Error type for ATR retrieval.
#[derive(Debug, Error)]
pub enum AtrError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("{interval} ATR{period}: not enough klines ({got})")]
    InsufficientData {
        interval: AtrInterval,
        period: usize,
        got: usize,
    },

    #[error("{interval} ATR{period} unavailable")]
    Unavailable { interval: AtrInterval, period: usize },
}

/// Supplies the current ATR value for a symbol.
#[async_trait]
pub trait AtrSource: Send + Sync {
    async fn fetch_atr(
        &self,
        symbol: &str,
        interval: AtrInterval,
        period: usize,
    ) -> Result<f64, AtrError>;
}

/// Wilder-smoothed ATR over `klines` with the given `period`.
///
/// Returns 0.0 unless `klines.len() > period > 0`. True range at index
/// `i >= 1` is `max(high - low, |high - prev_close|, |low - prev_close|)`;
/// the seed is the arithmetic mean of the first `period` true ranges and
/// subsequent bars are smoothed as `(atr * (period - 1) + tr) / period`.
pub fn wilder_atr(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() <= period {
        return 0.0;
    }

    let mut true_ranges = vec![0.0; klines.len()];
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;

        let tr1 = high - low;
        let tr2 = (high - prev_close).abs();
        let tr3 = (low - prev_close).abs();

        true_ranges[i] = tr1.max(tr2).max(tr3);
    }

    let seed: f64 = true_ranges[1..=period].iter().sum::<f64>() / period as f64;

    let mut atr = seed;
    for tr in &true_ranges[period + 1..] {
        atr = (atr * (period - 1) as f64 + tr) / period as f64;
    }

    atr
}

/// [`AtrSource`] backed by a kline provider.
pub struct KlineAtrSource<S> {
    klines: S,
}

impl<S: KlineSource> KlineAtrSource<S> {
    pub fn new(klines: S) -> Self {
        Self { klines }
    }
}

#[async_trait]
impl<S: KlineSource> AtrSource for KlineAtrSource<S> {
    async fn fetch_atr(
        &self,
        symbol: &str,
        interval: AtrInterval,
        period: usize,
    ) -> Result<f64, AtrError> {
        // one extra period of history so the Wilder smoothing has bars to settle
        let limit = (period * 2).max(period + 1);
        let klines = self.klines.get_klines(symbol, interval, limit).await?;

        if klines.len() <= period {
            return Err(AtrError::InsufficientData {
                interval,
                period,
                got: klines.len(),
            });
        }

        let atr = wilder_atr(&klines, period);
        if atr <= 0.0 {
            return Err(AtrError::Unavailable { interval, period });
        }
        Ok(atr)
    }
}
