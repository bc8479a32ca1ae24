// =============================================================================
// Metrics Sink — narrow capability injected into every component
// =============================================================================
//
// The core never touches a global metrics registry directly. Components hold
// an `Arc<dyn MetricsSink>`; the Prometheus-backed implementation forwards to
// the `metrics` facade (exported via metrics-exporter-prometheus in main.rs),
// and the null implementation is used in tests.
//
// The sink also owns the windowed error ratio consumed by the circuit
// breaker's error-rate latch: every external call reports success/failure via
// `observe_call`, and `error_rate()` returns errors/total over the window.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Metric names emitted by the engine. Kept in one place so the Prometheus
/// surface and the tests agree on spelling.
pub mod names {
    pub const ORDERS_TOTAL: &str = "orders_total";
    pub const ML_PREDICTIONS: &str = "ml_predictions";
    pub const ML_FAILURES: &str = "ml_failures";
    pub const ML_TIMEOUTS: &str = "ml_timeouts";
    pub const ML_FALLBACK_USES: &str = "ml_fallback_uses";
    pub const ML_OVERLOADS: &str = "ml_overloads";
    pub const ORDER_TIMEOUTS: &str = "order_timeouts";
    pub const ORDER_RETRIES: &str = "order_retries";
    pub const FEATURE_REJECTS: &str = "feature_rejects";

    pub const PNL_TOTAL: &str = "pnl_total";
    pub const POSITIONS: &str = "positions";
    pub const CIRCUIT_BREAKER_STATUS: &str = "circuit_breaker_status";
    pub const CURRENT_DRAWDOWN: &str = "current_drawdown";

    pub const ML_LATENCY: &str = "ml_latency";
    pub const ORDER_EXECUTION_DURATION: &str = "order_execution_duration";
    pub const ML_PREDICTION_SCORES: &str = "ml_prediction_scores";
}

/// Narrow metrics capability. Label values are owned strings because symbol
/// names are dynamic.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: u64);
    fn incr_counter_with(&self, name: &'static str, label: (&'static str, String), value: u64);
    fn set_gauge(&self, name: &'static str, value: f64);
    fn set_gauge_with(&self, name: &'static str, label: (&'static str, String), value: f64);
    fn record_histogram(&self, name: &'static str, value: f64);

    /// Report the outcome of an external call into the error window.
    fn observe_call(&self, ok: bool);

    /// Windowed error ratio in [0, 1]; 0.0 when the window is empty.
    fn error_rate(&self) -> f64;
}

// =============================================================================
// Windowed error ratio
// =============================================================================

/// Maximum samples retained regardless of age, to bound memory under bursts.
const ERROR_WINDOW_MAX_SAMPLES: usize = 4096;

/// Rolling error-ratio tracker over a fixed time window.
pub struct ErrorRateWindow {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, bool)>>,
}

impl ErrorRateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::with_capacity(256)),
        }
    }

    pub fn observe(&self, ok: bool) {
        self.observe_at(ok, Instant::now());
    }

    fn observe_at(&self, ok: bool, now: Instant) {
        let mut samples = self.samples.lock();
        samples.push_back((now, !ok));
        while samples.len() > ERROR_WINDOW_MAX_SAMPLES {
            samples.pop_front();
        }
        Self::prune(&mut samples, now, self.window);
    }

    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> f64 {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        if samples.is_empty() {
            return 0.0;
        }
        let errors = samples.iter().filter(|(_, err)| *err).count();
        errors as f64 / samples.len() as f64
    }

    fn prune(samples: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while samples
            .front()
            .map_or(false, |(t, _)| now.duration_since(*t) > window)
        {
            samples.pop_front();
        }
    }
}

// =============================================================================
// Prometheus-backed sink
// =============================================================================

/// Forwards everything to the `metrics` facade; the Prometheus exporter
/// installed in main.rs renders it at /metrics.
pub struct PrometheusSink {
    errors: ErrorRateWindow,
}

impl PrometheusSink {
    pub fn new(error_window: Duration) -> Self {
        Self {
            errors: ErrorRateWindow::new(error_window),
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn incr_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name, value);
    }

    fn incr_counter_with(&self, name: &'static str, label: (&'static str, String), value: u64) {
        let labels = [(label.0, label.1)];
        metrics::counter!(name, value, &labels);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name, value);
    }

    fn set_gauge_with(&self, name: &'static str, label: (&'static str, String), value: f64) {
        let labels = [(label.0, label.1)];
        metrics::gauge!(name, value, &labels);
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        metrics::histogram!(name, value);
    }

    fn observe_call(&self, ok: bool) {
        self.errors.observe(ok);
    }

    fn error_rate(&self) -> f64 {
        self.errors.rate()
    }
}

// =============================================================================
// Null sink (tests, benchmarks)
// =============================================================================

/// Discards all metrics but still tracks the error window, so risk paths
/// behave identically under test.
pub struct NullSink {
    errors: ErrorRateWindow,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            errors: ErrorRateWindow::new(Duration::from_secs(60)),
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for NullSink {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn incr_counter_with(&self, _name: &'static str, _label: (&'static str, String), _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
    fn set_gauge_with(&self, _name: &'static str, _label: (&'static str, String), _value: f64) {}
    fn record_histogram(&self, _name: &'static str, _value: f64) {}

    fn observe_call(&self, ok: bool) {
        self.errors.observe(ok);
    }

    fn error_rate(&self) -> f64 {
        self.errors.rate()
    }
}
