use super::RingBuf;

/// Rolling realized volatility: `sqrt(mean(r^2)) * sqrt(annualization)` over the
/// last `window` returns, or the demeaned (population) variant.
#[derive(Debug, Clone)]
pub struct RealizedVol {
    returns: RingBuf,
    annualization: f64,
    demean: bool,
}

impl RealizedVol {
    pub fn new(window: usize, annualization: f64, demean: bool) -> Self {
        Self {
            returns: RingBuf::new(window),
            annualization,
            demean,
        }
    }

    pub fn update(&mut self, ret: f64) -> Option<f64> {
        self.returns.push(ret);
        if !self.returns.full() {
            return None;
        }
        let n = self.returns.len() as f64;
        let var = if self.demean {
            let mean = self.returns.mean();
            self.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
        } else {
            self.returns.iter().map(|r| r * r).sum::<f64>() / n
        };
        Some(var.max(0.0).sqrt() * self.annualization.sqrt())
    }
}

/// Rolling percentile rank of the latest value within the trailing window.
///
/// Uses the mid-rank convention `(count(< x) + 0.5 * count(== x)) / window`, so a
/// constant series ranks at 0.5 and a fresh maximum ranks just below 1.0.
#[derive(Debug, Clone)]
pub struct PercentileRank {
    values: RingBuf,
}

impl PercentileRank {
    pub fn new(window: usize) -> Self {
        Self {
            values: RingBuf::new(window),
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.values.push(value);
        if !self.values.full() {
            return None;
        }
        Some(rank_within(value, self.values.iter(), self.values.len()))
    }
}

fn rank_within(value: f64, window: impl Iterator<Item = f64>, n: usize) -> f64 {
    let (mut less, mut equal) = (0usize, 0usize);
    for v in window {
        if v < value {
            less += 1;
        } else if v == value {
            equal += 1;
        }
    }
    (less as f64 + 0.5 * equal as f64) / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realized_vol_of_alternating_returns() {
        let mut rv = RealizedVol::new(4, 1.0, false);
        assert_eq!(rv.update(0.01), None);
        rv.update(-0.01);
        rv.update(0.01);
        let v = rv.update(-0.01).unwrap();
        assert!((v - 0.01).abs() < 1e-12);
    }

    #[test]
    fn demeaned_vol_ignores_drift() {
        let mut rv = RealizedVol::new(3, 1.0, true);
        rv.update(0.02);
        rv.update(0.02);
        assert!(rv.update(0.02).unwrap().abs() < 1e-12);
    }

    #[test]
    fn annualization_scales_by_sqrt() {
        let mut rv = RealizedVol::new(1, 365.0, false);
        let v = rv.update(0.01).unwrap();
        assert!((v - 0.01 * 365.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn constant_series_ranks_at_half() {
        let mut pr = PercentileRank::new(5);
        let mut last = None;
        for _ in 0..10 {
            last = pr.update(0.0);
        }
        assert!((last.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn fresh_maximum_ranks_near_one() {
        let mut pr = PercentileRank::new(100);
        for i in 0..99 {
            assert_eq!(pr.update(i as f64), None);
        }
        let r = pr.update(1_000.0).unwrap();
        assert!((r - 0.995).abs() < 1e-12);
    }
}
