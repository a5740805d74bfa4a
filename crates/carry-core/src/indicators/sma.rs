use super::RingBuf;

/// Simple moving average over the last `window` values.
/// Yields `None` until the window is full.
#[derive(Debug, Clone)]
pub struct Sma {
    buf: RingBuf,
}

impl Sma {
    pub fn new(window: usize) -> Self {
        Self {
            buf: RingBuf::new(window),
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.buf.push(value);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.buf.full() {
            Some(self.buf.mean())
        } else {
            None
        }
    }

    /// Feed an optional value; a gap restarts the window.
    pub fn update_opt(&mut self, value: Option<f64>) -> Option<f64> {
        match value {
            Some(v) => self.update(v),
            None => {
                self.buf.clear();
                None
            }
        }
    }

    pub fn is_warm(&self) -> bool {
        self.buf.full()
    }
}
