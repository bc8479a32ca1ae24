// =============================================================================
// Circuit Breaker — four latches guarding abnormal market and system state
// =============================================================================
//
// Latches:
//   1. Volatility      — window std / vwap above threshold.
//   2. Book imbalance  — |depth imbalance| above threshold.
//   3. Volume spike    — trade volume / window mean above threshold.
//   4. Error rate      — windowed external-call error ratio above threshold.
//
// Each latch is sticky: once its driver exceeds the threshold it stays set
// until the driver is back below threshold AND its own cooldown has elapsed.
// The timestamps are per-latch, so one latch recovering never shortens
// another latch's cooldown.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::metrics::{names, MetricsSink};

/// Snapshot of one latch for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LatchInfo {
    pub name: &'static str,
    pub last_value: f64,
    pub threshold: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Copy)]
struct Latch {
    tripped: bool,
    last_value: f64,
    last_triggered: Option<Instant>,
}

impl Latch {
    fn new() -> Self {
        Self {
            tripped: false,
            last_value: 0.0,
            last_triggered: None,
        }
    }

    /// Apply one observation; returns true when the trip state changed.
    fn apply(&mut self, value: f64, threshold: f64, recovery: Duration, now: Instant) -> bool {
        self.last_value = value;

        if value > threshold {
            let was = self.tripped;
            self.tripped = true;
            self.last_triggered = Some(now);
            return !was;
        }

        if self.tripped {
            let cooled = self
                .last_triggered
                .map_or(true, |t| now.duration_since(t) >= recovery);
            if cooled {
                self.tripped = false;
                return true;
            }
        }
        false
    }
}

struct Inner {
    volatility: Latch,
    imbalance: Latch,
    volume: Latch,
    error_rate: Latch,
}

/// Thread-safe four-latch breaker.
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    cfg: BreakerConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                volatility: Latch::new(),
                imbalance: Latch::new(),
                volume: Latch::new(),
                error_rate: Latch::new(),
            }),
            cfg,
            metrics,
        }
    }

    /// Feed the three market-driven signals.
    pub fn update_market_conditions(&self, volatility: f64, imbalance: f64, volume: f64) {
        self.update_market_at(volatility, imbalance, volume, Instant::now());
    }

    fn update_market_at(&self, volatility: f64, imbalance: f64, volume: f64, now: Instant) {
        let recovery = self.cfg.recovery_time();
        let mut inner = self.inner.write();

        let changed = [
            ("volatility", inner.volatility.apply(volatility, self.cfg.volatility, recovery, now)),
            ("imbalance", inner.imbalance.apply(imbalance.abs(), self.cfg.imbalance, recovery, now)),
            ("volume", inner.volume.apply(volume, self.cfg.volume, recovery, now)),
        ];

        let snapshot = [
            ("volatility", inner.volatility),
            ("imbalance", inner.imbalance),
            ("volume", inner.volume),
        ];
        drop(inner);

        for ((name, latch), (_, flipped)) in snapshot.iter().zip(changed.iter()) {
            self.emit(name, latch, *flipped);
        }
    }

    /// Feed the windowed error ratio.
    pub fn update_error_rate(&self, rate: f64) {
        self.update_error_rate_at(rate, Instant::now());
    }

    fn update_error_rate_at(&self, rate: f64, now: Instant) {
        let recovery = self.cfg.recovery_time();
        let mut inner = self.inner.write();
        let flipped = inner
            .error_rate
            .apply(rate, self.cfg.error_rate, recovery, now);
        let latch = inner.error_rate;
        drop(inner);

        self.emit("error_rate", &latch, flipped);
    }

    /// Any latch set means the executor refuses new trades.
    pub fn is_tripped(&self) -> bool {
        let inner = self.inner.read();
        inner.volatility.tripped
            || inner.imbalance.tripped
            || inner.volume.tripped
            || inner.error_rate.tripped
    }

    /// Latch snapshot for the state endpoint.
    pub fn snapshot(&self) -> Vec<LatchInfo> {
        let inner = self.inner.read();
        vec![
            Self::info("volatility", &inner.volatility, self.cfg.volatility),
            Self::info("imbalance", &inner.imbalance, self.cfg.imbalance),
            Self::info("volume", &inner.volume, self.cfg.volume),
            Self::info("error_rate", &inner.error_rate, self.cfg.error_rate),
        ]
    }

    fn info(name: &'static str, latch: &Latch, threshold: f64) -> LatchInfo {
        LatchInfo {
            name,
            last_value: latch.last_value,
            threshold,
            tripped: latch.tripped,
        }
    }

    fn emit(&self, name: &'static str, latch: &Latch, flipped: bool) {
        self.metrics.set_gauge_with(
            names::CIRCUIT_BREAKER_STATUS,
            ("latch", name.to_string()),
            if latch.tripped { 1.0 } else { 0.0 },
        );
        if flipped {
            if latch.tripped {
                warn!(latch = name, value = latch.last_value, "circuit breaker latch TRIPPED");
            } else {
                debug!(latch = name, "circuit breaker latch recovered");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;

    fn breaker(recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                volatility: 2.0,
                imbalance: 0.8,
                volume: 5.0,
                error_rate: 0.3,
                recovery_time_ms: recovery_ms,
            },
            Arc::new(NullSink::new()),
        )
    }

    #[test]
    fn starts_clear() {
        let b = breaker(100);
        assert!(!b.is_tripped());
    }

    #[test]
    fn volatility_spike_trips_and_recovers_after_cooldown() {
        // Volatility threshold 2.0 with a 100ms cooldown.
        let b = breaker(100);
        let t0 = Instant::now();

        b.update_market_at(3.0, 0.0, 1.0, t0);
        assert!(b.is_tripped());

        // Calm reading before the cooldown: still tripped.
        b.update_market_at(1.0, 0.0, 1.0, t0 + Duration::from_millis(50));
        assert!(b.is_tripped(), "cooldown has not elapsed");

        // Calm reading after the cooldown: clears.
        b.update_market_at(1.0, 0.0, 1.0, t0 + Duration::from_millis(150));
        assert!(!b.is_tripped());
    }

    #[test]
    fn stays_tripped_while_driver_remains_high() {
        let b = breaker(50);
        let t0 = Instant::now();

        b.update_market_at(3.0, 0.0, 1.0, t0);
        // Driver still over threshold long after the cooldown — the trigger
        // timestamp keeps advancing, so the latch never clears.
        b.update_market_at(3.0, 0.0, 1.0, t0 + Duration::from_millis(200));
        b.update_market_at(1.0, 0.0, 1.0, t0 + Duration::from_millis(210));
        assert!(b.is_tripped(), "cooldown restarts on every offending update");
    }

    #[test]
    fn latches_are_independent() {
        let b = breaker(100);
        let t0 = Instant::now();

        // Trip imbalance only (negative book pressure counts via |.|).
        b.update_market_at(0.1, -0.9, 1.0, t0);
        assert!(b.is_tripped());

        let snap = b.snapshot();
        let by_name = |n: &str| snap.iter().find(|l| l.name == n).unwrap();
        assert!(!by_name("volatility").tripped);
        assert!(by_name("imbalance").tripped);
        assert!(!by_name("volume").tripped);
        assert!(!by_name("error_rate").tripped);
    }

    #[test]
    fn one_latch_recovering_does_not_clear_another() {
        let b = breaker(100);
        let t0 = Instant::now();

        b.update_market_at(3.0, 0.0, 1.0, t0); // volatility trips
        b.update_market_at(1.0, 0.0, 6.0, t0 + Duration::from_millis(120)); // volatility calm, volume trips

        // Volatility cleared, volume holds the breaker.
        let snap = b.snapshot();
        assert!(!snap.iter().find(|l| l.name == "volatility").unwrap().tripped);
        assert!(snap.iter().find(|l| l.name == "volume").unwrap().tripped);
        assert!(b.is_tripped());
    }

    #[test]
    fn error_rate_latch_follows_same_rule() {
        let b = breaker(100);
        let t0 = Instant::now();

        b.update_error_rate_at(0.5, t0);
        assert!(b.is_tripped());

        b.update_error_rate_at(0.1, t0 + Duration::from_millis(50));
        assert!(b.is_tripped());

        b.update_error_rate_at(0.1, t0 + Duration::from_millis(150));
        assert!(!b.is_tripped());
    }

    #[test]
    fn boundary_value_does_not_trip() {
        let b = breaker(100);
        let t0 = Instant::now();
        // Exactly at threshold: latch requires strict exceedance.
        b.update_market_at(2.0, 0.8, 5.0, t0);
        assert!(!b.is_tripped());
    }
}
