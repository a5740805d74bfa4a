//! Per-bar feature extraction.
//!
//! [`FeatureEngine`] is fed one bar at a time and only holds rolling windows of
//! past values, so a snapshot for bar `i` is a function of bars `0..=i` only.
//!
//! Alongside trend and volatility it tracks a compression score (ATR and range
//! contraction against their trailing means, blended with a low vol
//! percentile) and a bullish expansion trigger: once compression has been
//! seen, a close above the prior rolling high with expanding vol in an
//! uptrend fires the trigger.

use serde::Serialize;

use crate::candle::Bar;
use crate::config::{CompressionConfig, RegimeConfig, TrendMethod};
use crate::indicators::atr::AtrIndicator;
use crate::indicators::ema::Ema;
use crate::indicators::sma::Sma;
use crate::indicators::volatility::{PercentileRank, RealizedVol};
use crate::indicators::RingBuf;

/// Feature values for one bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSnapshot {
    pub bar_index: u64,
    pub t: i64,
    pub close: f64,
    pub log_return: Option<f64>,
    pub realized_vol: Option<f64>,
    pub vol_pct: Option<f64>,
    pub moving_average: Option<f64>,
    /// -1, 0 or +1; 0 while the moving average is warming up or price sits inside the band.
    pub trend: i8,
    pub funding: Option<f64>,
    pub compression_score: Option<f64>,
    pub range_width: Option<f64>,
    pub expansion: bool,
    /// Trend and volatility percentile are both available.
    pub warm: bool,
}

#[derive(Debug, Clone)]
enum TrendAverage {
    Sma(Sma),
    Ema(Ema),
}

impl TrendAverage {
    fn update(&mut self, close: f64) -> Option<f64> {
        match self {
            TrendAverage::Sma(s) => s.update(close),
            TrendAverage::Ema(e) => {
                let v = e.update(close);
                e.is_warm().then_some(v)
            }
        }
    }
}

/// Trend sign of `close` relative to `ma` with a relative dead band.
pub fn trend_sign(close: f64, ma: Option<f64>, band: f64) -> i8 {
    match ma {
        Some(m) if close > m * (1.0 + band) => 1,
        Some(m) if close < m * (1.0 - band) => -1,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
struct CompressionState {
    cfg: CompressionConfig,
    atr: AtrIndicator,
    atr_mean: Sma,
    range_mean: Sma,
    vol: RealizedVol,
    vol_rank: PercentileRank,
    highs: RingBuf,
    lows: RingBuf,
    compressed_run: u32,
    was_compressed: bool,
}

impl CompressionState {
    fn new(cfg: &CompressionConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            atr: AtrIndicator::new(cfg.atr_window),
            atr_mean: Sma::new(cfg.contraction_lookback),
            range_mean: Sma::new(cfg.contraction_lookback),
            vol: RealizedVol::new(cfg.atr_window, 1.0, false),
            vol_rank: PercentileRank::new(cfg.vol_pct_window),
            highs: RingBuf::new(cfg.range_window),
            lows: RingBuf::new(cfg.range_window),
            compressed_run: 0,
            was_compressed: false,
        }
    }

    /// Returns `(score, range_width, prior_rolling_high)`.
    fn update(&mut self, bar: &Bar, log_return: Option<f64>) -> (Option<f64>, Option<f64>, Option<f64>) {
        let cfg = &self.cfg;
        let atr = self.atr.update(bar.h, bar.l, bar.c);
        let atr_mean = self.atr_mean.update_opt(atr);
        let range = bar.h - bar.l;
        let range_mean = self.range_mean.update(range);
        let vol_pct = log_return
            .and_then(|r| self.vol.update(r))
            .and_then(|v| self.vol_rank.update(v));

        let w_sum = cfg.weight_atr + cfg.weight_range + cfg.weight_vol;
        let norm = |w: f64| if w_sum > 0.0 { w / w_sum } else { 0.0 };
        let mut comp = 0.0;
        let mut weight = 0.0;
        if let (Some(a), Some(m)) = (atr, atr_mean) {
            if m > 0.0 {
                comp += norm(cfg.weight_atr) * (1.0 - a / m).clamp(0.0, 1.0);
                weight += norm(cfg.weight_atr);
            }
        }
        if let Some(m) = range_mean {
            if m > 0.0 {
                comp += norm(cfg.weight_range) * (1.0 - range / m).clamp(0.0, 1.0);
                weight += norm(cfg.weight_range);
            }
        }
        if let Some(p) = vol_pct {
            let low = cfg.vol_pct_low_threshold;
            comp += norm(cfg.weight_vol) * ((low - p) / low).clamp(0.0, 1.0);
            weight += norm(cfg.weight_vol);
        }
        let score = (weight > 0.0).then(|| comp / weight);

        match score {
            Some(s) if s >= cfg.score_trigger => self.compressed_run += 1,
            _ => self.compressed_run = 0,
        }
        if self.compressed_run >= cfg.breakout_confirm {
            self.was_compressed = true;
        }

        let prior_high = self.highs.full().then(|| self.highs.max());
        self.highs.push(bar.h);
        self.lows.push(bar.l);
        let width = self
            .highs
            .full()
            .then(|| self.highs.max() - self.lows.min());

        (score, width, prior_high)
    }
}

/// Incremental feature pipeline for one symbol.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    regime_cfg: RegimeConfig,
    bar_count: u64,
    prev_close: Option<f64>,
    trend_ma: TrendAverage,
    vol: RealizedVol,
    vol_rank: PercentileRank,
    compression: CompressionState,
}

impl FeatureEngine {
    pub fn new(regime: &RegimeConfig, compression: &CompressionConfig) -> Self {
        let trend_ma = match regime.trend_method {
            TrendMethod::Sma => TrendAverage::Sma(Sma::new(regime.long_ma_window)),
            TrendMethod::Ema => TrendAverage::Ema(Ema::new(regime.long_ma_window)),
        };
        Self {
            regime_cfg: regime.clone(),
            bar_count: 0,
            prev_close: None,
            trend_ma,
            vol: RealizedVol::new(
                regime.rv_window,
                regime.annualization_factor,
                regime.demean_returns,
            ),
            vol_rank: PercentileRank::new(regime.vol_percentile_window),
            compression: CompressionState::new(compression),
        }
    }

    pub fn bars_seen(&self) -> u64 {
        self.bar_count
    }

    /// Consume one validated bar and return its features.
    pub fn update(&mut self, bar: &Bar) -> FeatureSnapshot {
        let log_return = self.prev_close.map(|p| (bar.c / p).ln());
        self.prev_close = Some(bar.c);

        let realized_vol = log_return.and_then(|r| self.vol.update(r));
        let vol_pct = realized_vol.and_then(|v| self.vol_rank.update(v));
        let moving_average = self.trend_ma.update(bar.c);
        let trend = trend_sign(bar.c, moving_average, self.regime_cfg.trend_band);

        let (compression_score, range_width, prior_high) = self.compression.update(bar, log_return);
        let expansion = match (prior_high, vol_pct) {
            (Some(hi), Some(v)) => {
                self.compression.was_compressed
                    && bar.c > hi
                    && v >= self.compression.cfg.vol_expand_threshold
                    && trend > 0
            }
            _ => false,
        };

        let snap = FeatureSnapshot {
            bar_index: self.bar_count,
            t: bar.t,
            close: bar.c,
            log_return,
            realized_vol,
            vol_pct,
            moving_average,
            trend,
            funding: bar.funding,
            compression_score,
            range_width,
            expansion,
            warm: moving_average.is_some() && vol_pct.is_some(),
        };
        self.bar_count += 1;
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_regime() -> RegimeConfig {
        RegimeConfig {
            long_ma_window: 5,
            rv_window: 3,
            vol_percentile_window: 4,
            ..RegimeConfig::default()
        }
    }

    fn bar(t: i64, c: f64) -> Bar {
        Bar {
            t,
            o: c,
            h: c * 1.01,
            l: c * 0.99,
            c,
            v: 1.0,
            funding: None,
            open_interest: None,
        }
    }

    #[test]
    fn warmup_then_warm() {
        let mut fe = FeatureEngine::new(&small_regime(), &CompressionConfig::default());
        let mut warm_at = None;
        for i in 0..20 {
            let s = fe.update(&bar(i, 100.0 + (i % 3) as f64));
            if s.warm && warm_at.is_none() {
                warm_at = Some(i);
            }
        }
        // rv needs 3 returns (bar 3), percentile needs 4 rv values (bar 6)
        assert_eq!(warm_at, Some(6));
    }

    #[test]
    fn trend_sign_respects_band() {
        assert_eq!(trend_sign(100.05, Some(100.0), 0.001), 0);
        assert_eq!(trend_sign(100.2, Some(100.0), 0.001), 1);
        assert_eq!(trend_sign(99.8, Some(100.0), 0.001), -1);
        assert_eq!(trend_sign(150.0, None, 0.0), 0);
    }

    #[test]
    fn rising_series_has_positive_trend() {
        let mut fe = FeatureEngine::new(&small_regime(), &CompressionConfig::default());
        let mut last = None;
        for i in 0..10 {
            last = Some(fe.update(&bar(i, 100.0 * 1.01f64.powi(i as i32))));
        }
        assert_eq!(last.unwrap().trend, 1);
    }

    #[test]
    fn expansion_fires_after_compression_breakout() {
        let regime = RegimeConfig {
            long_ma_window: 10,
            rv_window: 3,
            vol_percentile_window: 10,
            ..RegimeConfig::default()
        };
        let comp = CompressionConfig {
            atr_window: 3,
            contraction_lookback: 5,
            vol_pct_window: 10,
            range_window: 5,
            ..CompressionConfig::default()
        };
        let mut fe = FeatureEngine::new(&regime, &comp);
        let mut t = 0;
        let mut px = 100.0;
        // noisy drift up
        for i in 0..20 {
            px *= if i % 2 == 0 { 1.02 } else { 0.99 };
            fe.update(&Bar { t, o: px, h: px * 1.02, l: px * 0.98, c: px, v: 1.0, funding: None, open_interest: None });
            t += 1;
        }
        // tight range
        for _ in 0..10 {
            fe.update(&Bar { t, o: px, h: px * 1.0005, l: px * 0.9995, c: px, v: 1.0, funding: None, open_interest: None });
            t += 1;
        }
        // breakout
        let mut fired = false;
        for _ in 0..3 {
            px *= 1.05;
            let s = fe.update(&Bar { t, o: px, h: px * 1.01, l: px * 0.99, c: px, v: 1.0, funding: None, open_interest: None });
            fired |= s.expansion;
            t += 1;
        }
        assert!(fired);
    }

    #[test]
    fn snapshot_depends_only_on_past_bars() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| bar(i, 100.0 + ((i * 7) % 11) as f64))
            .collect();
        let mut full = FeatureEngine::new(&small_regime(), &CompressionConfig::default());
        let full_snaps: Vec<_> = bars.iter().map(|b| full.update(b)).collect();
        let mut truncated = FeatureEngine::new(&small_regime(), &CompressionConfig::default());
        for (i, b) in bars[..30].iter().enumerate() {
            assert_eq!(truncated.update(b), full_snaps[i]);
        }
    }
}
