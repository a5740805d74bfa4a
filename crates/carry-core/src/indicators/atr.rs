/// Average True Range with Wilder smoothing.
///
/// The first value is the plain mean of the first `window` true ranges
/// (available on bar `window - 1`); afterwards `ATR = (prev * (N-1) + TR) / N`.
/// The first bar's true range is `high - low`.
#[derive(Debug, Clone)]
pub struct AtrIndicator {
    window: usize,
    prev_close: Option<f64>,
    atr_value: f64,
    count: usize,
    sum: f64,
    warm: bool,
}

impl AtrIndicator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            prev_close: None,
            atr_value: 0.0,
            count: 0,
            sum: 0.0,
            warm: false,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let tr = match self.prev_close {
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);

        if !self.warm {
            self.sum += tr;
            self.count += 1;
            if self.count >= self.window {
                self.atr_value = self.sum / self.window as f64;
                self.warm = true;
                return Some(self.atr_value);
            }
            return None;
        }
        self.atr_value = (self.atr_value * (self.window as f64 - 1.0) + tr) / self.window as f64;
        Some(self.atr_value)
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }
}
