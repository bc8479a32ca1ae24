// =============================================================================
// Order-flow imbalances — signed tick ratio and depth ratio
// =============================================================================

use std::collections::VecDeque;

use crate::types::Side;

/// Bounded FIFO of the last T signed aggressor indicators (+1 buy, −1 sell).
///
/// The ratio is Σ/T once the window is full, Σ/len while it is filling, and
/// 0.0 when empty — always in [−1, 1].
pub struct TickImbalance {
    window: usize,
    ticks: VecDeque<i8>,
    sum: i64,
}

impl TickImbalance {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            ticks: VecDeque::with_capacity(window),
            sum: 0,
        }
    }

    pub fn add(&mut self, side: Side) {
        let indicator: i8 = match side {
            Side::Buy => 1,
            Side::Sell => -1,
        };
        self.ticks.push_back(indicator);
        self.sum += indicator as i64;

        if self.ticks.len() > self.window {
            if let Some(old) = self.ticks.pop_front() {
                self.sum -= old as i64;
            }
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.ticks.is_empty() {
            return 0.0;
        }
        let denom = if self.ticks.len() >= self.window {
            self.window
        } else {
            self.ticks.len()
        };
        self.sum as f64 / denom as f64
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn reset(&mut self) {
        self.ticks.clear();
        self.sum = 0;
    }
}

/// `(bid − ask) / (bid + ask)`, 0.0 when the book is empty. Always in [−1, 1]
/// for non-negative inputs.
pub fn depth_imbalance(bid_volume: f64, ask_volume: f64) -> f64 {
    let total = bid_volume + ask_volume;
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    (bid_volume - ask_volume) / total
}
