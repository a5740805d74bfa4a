//! Bar representation and ingestion-time validation.

use serde::{Deserialize, Serialize};

/// One OHLCV bar, optionally carrying the funding rate accrued over the bar
/// and the open interest at its close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub t: i64, // open time (ms since epoch, UTC)
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
}

/// Bars keyed by symbol.
pub type CandleData = rustc_hash::FxHashMap<String, Vec<Bar>>;

/// Why a bar was rejected at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarFault {
    NonFinitePrice,
    NonPositivePrice,
    InvertedRange,
    NegativeVolume,
    NonFiniteFunding,
    /// Timestamp earlier than or equal to the previous accepted bar.
    OutOfOrder,
}

impl std::fmt::Display for BarFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BarFault::NonFinitePrice => "non-finite price",
            BarFault::NonPositivePrice => "non-positive price",
            BarFault::InvertedRange => "high below low",
            BarFault::NegativeVolume => "negative or non-finite volume",
            BarFault::NonFiniteFunding => "non-finite funding rate",
            BarFault::OutOfOrder => "timestamp not after previous bar",
        };
        f.write_str(s)
    }
}

impl Bar {
    /// Flat bar at `price` with zero volume and no funding.
    pub fn flat(t: i64, price: f64) -> Self {
        Self {
            t,
            o: price,
            h: price,
            l: price,
            c: price,
            v: 0.0,
            funding: None,
            open_interest: None,
        }
    }

    /// Validate this bar against the previously accepted bar's timestamp.
    pub fn fault(&self, prev_t: Option<i64>) -> Option<BarFault> {
        let prices = [self.o, self.h, self.l, self.c];
        if prices.iter().any(|p| !p.is_finite()) {
            return Some(BarFault::NonFinitePrice);
        }
        if prices.iter().any(|&p| p <= 0.0) {
            return Some(BarFault::NonPositivePrice);
        }
        if self.h < self.l {
            return Some(BarFault::InvertedRange);
        }
        if !self.v.is_finite() || self.v < 0.0 {
            return Some(BarFault::NegativeVolume);
        }
        if matches!(self.funding, Some(f) if !f.is_finite()) {
            return Some(BarFault::NonFiniteFunding);
        }
        if matches!(prev_t, Some(p) if self.t <= p) {
            return Some(BarFault::OutOfOrder);
        }
        None
    }

    #[inline]
    pub fn funding_rate(&self) -> f64 {
        self.funding.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_bar_is_valid() {
        assert_eq!(Bar::flat(0, 100.0).fault(None), None);
    }

    #[test]
    fn detects_price_faults() {
        let mut b = Bar::flat(0, 100.0);
        b.c = f64::NAN;
        assert_eq!(b.fault(None), Some(BarFault::NonFinitePrice));
        b.c = 0.0;
        assert_eq!(b.fault(None), Some(BarFault::NonPositivePrice));
        b.c = 100.0;
        b.h = 90.0;
        assert_eq!(b.fault(None), Some(BarFault::InvertedRange));
    }

    #[test]
    fn detects_out_of_order_and_duplicates() {
        let b = Bar::flat(1_000, 100.0);
        assert_eq!(b.fault(Some(2_000)), Some(BarFault::OutOfOrder));
        assert_eq!(b.fault(Some(1_000)), Some(BarFault::OutOfOrder));
        assert_eq!(b.fault(Some(999)), None);
    }

    #[test]
    fn detects_volume_and_funding_faults() {
        let mut b = Bar::flat(0, 100.0);
        b.v = -1.0;
        assert_eq!(b.fault(None), Some(BarFault::NegativeVolume));
        b.v = 1.0;
        b.funding = Some(f64::INFINITY);
        assert_eq!(b.fault(None), Some(BarFault::NonFiniteFunding));
    }
}
