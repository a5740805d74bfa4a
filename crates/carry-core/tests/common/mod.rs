//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use carry_core::candle::Bar;
use carry_core::config::{
    AllocationBand, CompressionConfig, FundingMode, GuidanceConfig, RegimeConfig, SimConfig,
};
use risk_core::RiskConfig;

pub const HOUR_MS: i64 = 3_600_000;

/// Regime driven by trend alone (vol bands pinned open, no extreme override)
/// and a directional overlay large enough to move NAV. Carry sits at 10% in
/// every regime.
pub fn directional_cfg() -> SimConfig {
    SimConfig {
        initial_nav: 100_000.0,
        regime: RegimeConfig {
            long_ma_window: 10,
            rv_window: 5,
            vol_percentile_window: 20,
            confirm_bars: 2,
            risk_on_vol_pct_max: 0.99,
            risk_on_exit_vol_pct: 0.99,
            risk_off_vol_pct_min: 1.0,
            risk_off_exit_vol_pct: 1.0,
            extreme_vol_pct: 1.0,
            funding_mode: FundingMode::Ignore,
            ..RegimeConfig::default()
        },
        compression: CompressionConfig {
            atr_window: 3,
            contraction_lookback: 5,
            vol_pct_window: 10,
            range_window: 5,
            breakout_confirm: 1,
            score_trigger: 0.05,
            vol_expand_threshold: 0.01,
            ..CompressionConfig::default()
        },
        guidance: GuidanceConfig {
            risk_off_carry: AllocationBand::new(0.1, 0.1),
            neutral_carry: AllocationBand::new(0.1, 0.1),
            risk_on_carry: AllocationBand::new(0.1, 0.1),
            risk_on_directional: AllocationBand::new(0.85, 0.85),
            ..GuidanceConfig::default()
        },
        risk: RiskConfig {
            venue_cap_frac: 1.0,
            vol_spike_vol_pct: 1.0,
            ..RiskConfig::default()
        },
        ..SimConfig::default()
    }
}

/// Hourly bar series built close by close; each bar opens at the previous close.
pub struct Path {
    pub bars: Vec<Bar>,
    price: f64,
}

impl Path {
    pub fn new(price: f64) -> Self {
        Self {
            bars: Vec::new(),
            price,
        }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn push(&mut self, close: f64, wick_up: f64, wick_down: f64) {
        let open = self.price;
        self.bars.push(Bar {
            t: self.bars.len() as i64 * HOUR_MS,
            o: open,
            h: open.max(close) * (1.0 + wick_up),
            l: open.min(close) * (1.0 - wick_down),
            c: close,
            v: 1.0,
            funding: None,
            open_interest: None,
        });
        self.price = close;
    }

    pub fn hold(&mut self, n: usize, wick: f64) {
        for _ in 0..n {
            self.push(self.price, wick, wick);
        }
    }

    /// `n` bars each closing at `factor` times the previous close.
    pub fn grow(&mut self, n: usize, factor: f64, wick: f64) {
        for _ in 0..n {
            self.push(self.price * factor, wick, wick);
        }
    }
}

/// 30 wide flat bars then 10 tight ones: the compression detector is armed
/// and the regime is warm when the next bar arrives.
pub fn compressed_base() -> Path {
    let mut path = Path::new(100.0);
    path.hold(30, 0.02);
    path.hold(10, 0.0005);
    path
}
