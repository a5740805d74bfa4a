/// Exponential Moving Average, incremental.
///
///   bar 0  → value = price (seeded with the first observation)
///   bar 1+ → value = α·price + (1−α)·prev   where α = 2/(span+1)
///
/// `is_warm()` returns true once `span` bars have been seen.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    pub value: f64,
    span: usize,
    count: usize,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        Self {
            alpha: 2.0 / (span as f64 + 1.0),
            value: 0.0,
            span,
            count: 0,
        }
    }

    /// Feed one price, return the current EMA value.
    pub fn update(&mut self, price: f64) -> f64 {
        if self.count == 0 {
            self.value = price;
        } else {
            self.value = self.alpha * price + (1.0 - self.alpha) * self.value;
        }
        self.count += 1;
        self.value
    }

    pub fn is_warm(&self) -> bool {
        self.count >= self.span
    }
}
