//! Shared accounting primitives for fees, slippage, funding and perp marks.
//! Every monetary amount that touches cash goes through [`quantize`] so runs are
//! reproducible bit for bit.

use crate::config::ExecutionConfig;

/// Precision scale used for deterministic rounding in the simulator.
pub const ACCOUNTING_QUANTUM: f64 = 1_000_000_000_000.0;

/// Rounding helper shared by the simulator and the paper venue.
#[inline]
pub fn quantize(value: f64) -> f64 {
    (value * ACCOUNTING_QUANTUM).round() / ACCOUNTING_QUANTUM
}

/// Taker fee model (all simulated fills cross the spread).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeModel {
    pub taker_fee_bps: f64,
}

impl FeeModel {
    #[inline]
    pub fn rate(self) -> f64 {
        self.taker_fee_bps / 10_000.0
    }

    #[inline]
    pub fn fee(self, notional: f64) -> f64 {
        quantize(notional.abs() * self.rate())
    }
}

/// Slippage as a fraction of price: `max(fixed_bps / 1e4, k * |notional| / nav)`
/// with `k = bps_at_1x_nav / 1e4`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlippageModel {
    pub fixed_bps: f64,
    pub bps_at_1x_nav: f64,
}

impl SlippageModel {
    pub fn fraction(self, notional: f64, nav: f64) -> f64 {
        let floor = self.fixed_bps / 10_000.0;
        if !nav.is_finite() || nav <= 0.0 {
            return floor;
        }
        floor.max(self.bps_at_1x_nav / 10_000.0 * notional.abs() / nav)
    }

    #[inline]
    pub fn estimate_bps(self, notional: f64, nav: f64) -> f64 {
        self.fraction(notional, nav) * 10_000.0
    }
}

impl From<&ExecutionConfig> for FeeModel {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            taker_fee_bps: cfg.taker_fee_bps,
        }
    }
}

impl From<&ExecutionConfig> for SlippageModel {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            fixed_bps: cfg.slippage_fixed_bps,
            bps_at_1x_nav: cfg.slippage_bps_at_1x_nav,
        }
    }
}

/// Requested price moved against the taker by `slip_frac`.
#[inline]
pub fn executed_price(requested: f64, is_buy: bool, slip_frac: f64) -> f64 {
    if is_buy {
        requested * (1.0 + slip_frac)
    } else {
        requested * (1.0 - slip_frac)
    }
}

/// Perp variation margin realised when the mark moves from `prev_mark` to `mark`.
#[inline]
pub fn perp_mark_pnl(signed_qty: f64, prev_mark: f64, mark: f64) -> f64 {
    quantize(signed_qty * (mark - prev_mark))
}

/// Funding cash flow for a perp position. A positive rate means longs pay shorts.
#[inline]
pub fn funding_delta(signed_qty: f64, mark_price: f64, rate: f64) -> f64 {
    quantize(-signed_qty * mark_price * rate)
}

/// Index of the funding window containing `t_ms`.
#[inline]
pub fn funding_slot(t_ms: i64, interval_hours: u32) -> i64 {
    let period = i64::from(interval_hours.max(1)) * 3_600_000;
    t_ms.div_euclid(period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounding_works_to_12_dp() {
        assert_eq!(quantize(1.2345_6789_0123_4567), 1.234567890123);
        assert_eq!(quantize(0.000_000_000_000_4), 0.0);
    }

    #[test]
    fn fee_is_symmetric_in_side() {
        let fees = FeeModel { taker_fee_bps: 5.0 };
        assert!((fees.fee(10_000.0) - 5.0).abs() < 1e-12);
        assert!((fees.fee(-10_000.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn slippage_has_fixed_floor_and_size_term() {
        let slip = SlippageModel {
            fixed_bps: 1.0,
            bps_at_1x_nav: 10.0,
        };
        // small trade: floor
        assert!((slip.fraction(1_000.0, 1_000_000.0) - 1e-4).abs() < 1e-15);
        // 0.5x NAV: 5 bps
        assert!((slip.fraction(500_000.0, 1_000_000.0) - 5e-4).abs() < 1e-15);
        assert!((slip.estimate_bps(500_000.0, 1_000_000.0) - 5.0).abs() < 1e-9);
        // degenerate NAV falls back to the floor
        assert!((slip.fraction(500_000.0, 0.0) - 1e-4).abs() < 1e-15);
    }

    #[test]
    fn executed_price_moves_against_taker() {
        assert!(executed_price(100.0, true, 0.001) > 100.0);
        assert!(executed_price(100.0, false, 0.001) < 100.0);
    }

    #[test]
    fn positive_funding_charges_longs_and_pays_shorts() {
        assert!((funding_delta(1.0, 100.0, 0.0001) + 0.01).abs() < 1e-12);
        assert!((funding_delta(-1.0, 100.0, 0.0001) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn funding_slots_follow_interval() {
        let h = 3_600_000;
        assert_eq!(funding_slot(0, 8), 0);
        assert_eq!(funding_slot(7 * h, 8), 0);
        assert_eq!(funding_slot(8 * h, 8), 1);
    }
}
