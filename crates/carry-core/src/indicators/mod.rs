//! Incremental indicators. Every indicator consumes one value per bar and
//! only ever looks at values already pushed, so nothing here can see the future.

pub mod atr;
pub mod ema;
pub mod sma;
pub mod volatility;

/// Ring buffer for rolling-window computations (SMA, realized vol, percentile rank, range).
#[derive(Debug, Clone)]
pub struct RingBuf {
    buf: Vec<f64>,
    pos: usize,
    len: usize,
    cap: usize,
}

impl RingBuf {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            buf: vec![0.0; cap],
            pos: 0,
            len: 0,
            cap,
        }
    }

    /// Push a value, returning the one it evicted once the buffer is full.
    pub fn push(&mut self, val: f64) -> Option<f64> {
        let evicted = if self.len == self.cap {
            Some(self.buf[self.pos])
        } else {
            None
        };
        self.buf[self.pos] = val;
        self.pos = (self.pos + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    pub fn full(&self) -> bool {
        self.len == self.cap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Iterate over values in insertion order (oldest first).
    pub fn iter(&self) -> RingBufIter<'_> {
        RingBufIter {
            buf: &self.buf,
            start: if self.len < self.cap { 0 } else { self.pos },
            count: 0,
            total: self.len,
            cap: self.cap,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.iter().sum::<f64>() / self.len as f64
    }

    pub fn min(&self) -> f64 {
        self.iter().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.iter().fold(f64::NEG_INFINITY, f64::max)
    }
}

pub struct RingBufIter<'a> {
    buf: &'a [f64],
    start: usize,
    count: usize,
    total: usize,
    cap: usize,
}

impl<'a> Iterator for RingBufIter<'a> {
    type Item = f64;
    fn next(&mut self) -> Option<f64> {
        if self.count >= self.total {
            return None;
        }
        let idx = (self.start + self.count) % self.cap;
        self.count += 1;
        Some(self.buf[idx])
    }
}
