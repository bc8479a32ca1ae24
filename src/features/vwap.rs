// =============================================================================
// VWAP Window — rolling volume-weighted mean and deviation over a ring buffer
// =============================================================================
//
// The ring is preallocated to its capacity once and never reallocates; reset
// only rewinds the indices and zeroes the running sums. Eviction happens on
// every insert: first by age (samples older than the window relative to the
// incoming timestamp), then by size when the ring is still full.
//
// Running sums Σv, Σpv, Σp²v make calc() O(1). Variance uses
// Σp²v/Σv − vwap², clamped at zero — the clamp is part of the contract, not a
// workaround: float cancellation can produce tiny negatives.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;

use crate::types::{EngineError, Side};

/// One accepted trade sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    ts: DateTime<Utc>,
    price: f64,
    volume: f64,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            ts: DateTime::<Utc>::MIN_UTC,
            price: 0.0,
            volume: 0.0,
        }
    }
}

/// Consistent point-in-time view of the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapSnapshot {
    pub vwap: f64,
    pub std: f64,
    pub count: usize,
    /// Mean per-sample volume, used for the volume-spike breaker signal.
    pub avg_volume: f64,
}

impl VwapSnapshot {
    fn empty() -> Self {
        Self {
            vwap: 0.0,
            std: 0.0,
            count: 0,
            avg_volume: 0.0,
        }
    }
}

struct Ring {
    buf: Vec<Sample>,
    head: usize,
    len: usize,
    sum_v: f64,
    sum_pv: f64,
    sum_ppv: f64,
    rejected: u64,
}

impl Ring {
    fn evict_front(&mut self) {
        debug_assert!(self.len > 0);
        let s = self.buf[self.head];
        self.sum_v -= s.volume;
        self.sum_pv -= s.price * s.volume;
        self.sum_ppv -= s.price * s.price * s.volume;
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        if self.len == 0 {
            // Rebase the sums so float residue cannot accumulate forever.
            self.sum_v = 0.0;
            self.sum_pv = 0.0;
            self.sum_ppv = 0.0;
        }
    }

    fn push_back(&mut self, s: Sample) {
        debug_assert!(self.len < self.buf.len());
        let idx = (self.head + self.len) % self.buf.len();
        self.buf[idx] = s;
        self.len += 1;
        self.sum_v += s.volume;
        self.sum_pv += s.price * s.volume;
        self.sum_ppv += s.price * s.price * s.volume;
    }

    fn front_ts(&self) -> Option<DateTime<Utc>> {
        (self.len > 0).then(|| self.buf[self.head].ts)
    }
}

/// Rolling VWAP window with both time- and size-eviction.
pub struct VwapWindow {
    window: Duration,
    inner: Mutex<Ring>,
}

impl VwapWindow {
    /// Preallocate a ring of `capacity` samples covering `window` of time.
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            inner: Mutex::new(Ring {
                buf: vec![Sample::default(); capacity],
                head: 0,
                len: 0,
                sum_v: 0.0,
                sum_pv: 0.0,
                sum_ppv: 0.0,
                rejected: 0,
            }),
        }
    }

    /// Insert a sample. Non-finite or non-positive prices and non-finite or
    /// negative volumes are rejected and counted.
    pub fn add(
        &self,
        price: f64,
        volume: f64,
        _side: Side,
        ts: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut ring = self.inner.lock();

        if !price.is_finite() || price <= 0.0 || !volume.is_finite() || volume < 0.0 {
            ring.rejected += 1;
            return Err(EngineError::Validation(format!(
                "rejected sample price={price} volume={volume}"
            )));
        }

        // Age eviction relative to the incoming timestamp.
        let cutoff = ts
            - chrono::Duration::from_std(self.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        while ring.front_ts().map_or(false, |t| t < cutoff) {
            ring.evict_front();
        }

        // Size eviction.
        if ring.len == ring.buf.len() {
            ring.evict_front();
        }

        ring.push_back(Sample { ts, price, volume });
        Ok(())
    }

    /// Consistent snapshot of the window. Undefined VWAP (zero cumulative
    /// volume) yields the zero snapshot.
    pub fn calc(&self) -> VwapSnapshot {
        let ring = self.inner.lock();

        if ring.len == 0 || ring.sum_v <= 0.0 {
            return VwapSnapshot::empty();
        }

        let vwap = ring.sum_pv / ring.sum_v;
        let variance = (ring.sum_ppv / ring.sum_v - vwap * vwap).max(0.0);

        VwapSnapshot {
            vwap,
            std: variance.sqrt(),
            count: ring.len,
            avg_volume: ring.sum_v / ring.len as f64,
        }
    }

    /// Empty the window without touching the backing storage.
    pub fn reset(&self) {
        let mut ring = self.inner.lock();
        ring.head = 0;
        ring.len = 0;
        ring.sum_v = 0.0;
        ring.sum_pv = 0.0;
        ring.sum_ppv = 0.0;
    }

    /// Samples rejected for NaN/Inf/out-of-range inputs since construction.
    pub fn rejected_samples(&self) -> u64 {
        self.inner.lock().rejected
    }

    /// Ring capacity (stable across reset — the buffer is reused).
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn vwap_weights_by_volume() {
        let w = VwapWindow::new(600, Duration::from_secs(30));
        w.add(100.0, 3.0, Side::Buy, ts(0)).unwrap();
        w.add(106.0, 1.0, Side::Sell, ts(1)).unwrap();
        let snap = w.calc();
        // (300 + 106) / 4 = 101.5
        assert!((snap.vwap - 101.5).abs() < 1e-10);
        assert_eq!(snap.count, 2);
    }

    #[test]
    fn single_sample_has_zero_std() {
        let w = VwapWindow::new(600, Duration::from_secs(30));
        w.add(100.0, 2.0, Side::Buy, ts(0)).unwrap();
        let snap = w.calc();
        assert!((snap.vwap - 100.0).abs() < 1e-10);
        assert!(snap.std.abs() < 1e-9, "std {} should be ~0", snap.std);
    }

    #[test]
    fn age_eviction_drops_stale_samples() {
        // W=30s: a sample at t=0 is stale by the time t=31s arrives.
        let w = VwapWindow::new(600, Duration::from_secs(30));
        w.add(100.0, 1.0, Side::Buy, ts(0)).unwrap();
        w.add(200.0, 1.0, Side::Buy, ts(31)).unwrap();
        let snap = w.calc();
        assert!((snap.vwap - 200.0).abs() < 1e-10);
        assert!(snap.std.abs() < 1e-9);
        assert_eq!(snap.count, 1);
    }

    #[test]
    fn expired_window_equals_never_added() {
        let w = VwapWindow::new(600, Duration::from_secs(30));
        let baseline = {
            let fresh = VwapWindow::new(600, Duration::from_secs(30));
            fresh.add(250.0, 1.0, Side::Buy, ts(100)).unwrap();
            fresh.calc()
        };

        w.add(999.0, 5.0, Side::Sell, ts(0)).unwrap();
        // The stale sample falls out when the in-window one arrives.
        w.add(250.0, 1.0, Side::Buy, ts(100)).unwrap();
        let snap = w.calc();
        assert!((snap.vwap - baseline.vwap).abs() < 1e-10);
        assert_eq!(snap.count, baseline.count);
    }

    #[test]
    fn size_eviction_keeps_newest() {
        let w = VwapWindow::new(3, Duration::from_secs(3600));
        for (i, price) in [100.0, 110.0, 120.0, 130.0].iter().enumerate() {
            w.add(*price, 1.0, Side::Buy, ts(i as i64)).unwrap();
        }
        let snap = w.calc();
        assert_eq!(snap.count, 3);
        // (110 + 120 + 130) / 3
        assert!((snap.vwap - 120.0).abs() < 1e-10);
    }

    #[test]
    fn rejects_nan_and_infinite_inputs() {
        let w = VwapWindow::new(600, Duration::from_secs(30));
        assert!(w.add(f64::NAN, 1.0, Side::Buy, ts(0)).is_err());
        assert!(w.add(100.0, f64::INFINITY, Side::Buy, ts(0)).is_err());
        assert!(w.add(-5.0, 1.0, Side::Buy, ts(0)).is_err());
        assert!(w.add(100.0, -1.0, Side::Buy, ts(0)).is_err());
        assert_eq!(w.rejected_samples(), 4);

        // Rejected samples never pollute the window.
        assert_eq!(w.calc().count, 0);

        // Valid data after rejections still yields finite results.
        w.add(100.0, 1.0, Side::Buy, ts(1)).unwrap();
        let snap = w.calc();
        assert!(snap.vwap.is_finite());
        assert!(snap.std.is_finite());
    }

    #[test]
    fn zero_volume_samples_yield_empty_snapshot() {
        let w = VwapWindow::new(600, Duration::from_secs(30));
        w.add(100.0, 0.0, Side::Buy, ts(0)).unwrap();
        // Cumulative volume is zero — VWAP is undefined.
        let snap = w.calc();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.vwap, 0.0);
        assert_eq!(snap.std, 0.0);
    }

    #[test]
    fn reset_empties_without_reallocating() {
        let w = VwapWindow::new(64, Duration::from_secs(30));
        for i in 0..40 {
            w.add(100.0 + i as f64, 1.0, Side::Buy, ts(i)).unwrap();
        }
        let cap_before = w.capacity();

        for _ in 0..10 {
            w.reset();
        }

        let snap = w.calc();
        assert_eq!((snap.vwap, snap.std, snap.count), (0.0, 0.0, 0));
        assert_eq!(w.capacity(), cap_before, "reset must reuse the ring");

        // The window is fully usable after reset.
        w.add(42.0, 2.0, Side::Sell, ts(100)).unwrap();
        assert!((w.calc().vwap - 42.0).abs() < 1e-10);
    }

    #[test]
    fn variance_is_clamped_non_negative() {
        let w = VwapWindow::new(600, Duration::from_secs(3600));
        // Large identical prices provoke float cancellation in Σp²v/Σv − μ².
        for i in 0..100 {
            w.add(1.0e9 + 0.0001, 1.0, Side::Buy, ts(i)).unwrap();
        }
        let snap = w.calc();
        assert!(snap.std >= 0.0);
        assert!(snap.std.is_finite());
    }
}
