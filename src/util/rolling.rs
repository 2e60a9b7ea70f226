//! Fixed-size rolling weighted average
//!
//! Used for tick-duration reporting windows and anywhere a windowed rate is
//! needed. Totals are maintained incrementally; the window is never rescanned.

/// Circular buffer of `(value, weight)` pairs with a running weighted total.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    values: Vec<f64>,
    weights: Vec<f64>,
    cursor: usize,
    filled: usize,
    total_value: f64,
    total_weight: f64,
}

impl RollingAverage {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rolling window needs at least one slot");
        Self {
            values: vec![0.0; capacity],
            weights: vec![0.0; capacity],
            cursor: 0,
            filled: 0,
            total_value: 0.0,
            total_weight: 0.0,
        }
    }

    /// Insert a sample, evicting the oldest once the window is full. O(1).
    pub fn insert(&mut self, value: f64, weight: f64) {
        self.total_value -= self.values[self.cursor];
        self.total_weight -= self.weights[self.cursor];

        let weighted = value * weight;
        self.values[self.cursor] = weighted;
        self.weights[self.cursor] = weight;
        self.total_value += weighted;
        self.total_weight += weight;

        self.cursor = (self.cursor + 1) % self.values.len();
        if self.filled < self.values.len() {
            self.filled += 1;
        }
    }

    /// Weighted average over the window, or 0.0 before any sample.
    pub fn average(&self) -> f64 {
        if self.total_weight <= f64::EPSILON {
            0.0
        } else {
            self.total_value / self.total_weight
        }
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }
}
