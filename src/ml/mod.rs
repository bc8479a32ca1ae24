// =============================================================================
// ML Gate — model-backed trade approval with deterministic fallback
// =============================================================================
//
// Every decision path lands on a probability pair [p0, p1]:
//
//   validate -> cache -> (semaphore, timeout) -> model -> validate output
//
// Any failure along the chain (bad input, over-capacity, deadline, model
// error, out-of-range output) falls back to the deterministic heuristic and
// bumps the matching counter. The gate itself never errors: callers always
// get a usable decision.
// =============================================================================

pub mod cache;
pub mod runtime;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::config::MlConfig;
use crate::features::{FeatureVector, FEATURE_DIMENSION};
use crate::metrics::{names, MetricsSink};

pub use cache::PredictionCache;
pub use runtime::{ExternalRuntime, ModelArtifact, ModelRuntime, NativeRuntime};

// ── Fallback heuristic constants ─────────────────────────────────────────────

const FALLBACK_BASE: f64 = 0.5;
const TICK_STRONG: f64 = 0.3;
const TICK_ADJUST: f64 = 0.2;
const DEPTH_STRONG: f64 = 0.2;
const DEPTH_ADJUST: f64 = 0.15;
const DIST_SWEET_LOW: f64 = 1.5;
const DIST_SWEET_HIGH: f64 = 3.0;
const DIST_SWEET_BONUS: f64 = 0.3;
const DIST_EXTREME_PENALTY: f64 = 0.4;

/// Validation bounds for each feature, in wire order.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRanges {
    pub tick: (f64, f64),
    pub depth: (f64, f64),
    pub price_distance: (f64, f64),
}

impl FeatureRanges {
    pub fn with_max_distance(max_distance: f64) -> Self {
        Self {
            tick: (-1.0, 1.0),
            depth: (-1.0, 1.0),
            price_distance: (-max_distance, max_distance),
        }
    }

    fn bounds(&self, index: usize) -> (f64, f64) {
        match index {
            0 => self.tick,
            1 => self.depth,
            _ => self.price_distance,
        }
    }
}

impl Default for FeatureRanges {
    fn default() -> Self {
        Self::with_max_distance(5.0)
    }
}

/// Counters mirrored into the metrics sink, kept locally so the state
/// endpoint and tests can read them without a Prometheus scrape.
#[derive(Default)]
struct Counters {
    predictions: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    overloads: AtomicU64,
    cache_hits: AtomicU64,
}

/// Serialisable gate statistics for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MlGateStats {
    pub predictions: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub overloads: u64,
    pub cache_hits: u64,
    pub cache_len: usize,
}

/// The gate. Cheap to share via `Arc`.
pub struct MlGate {
    runtime: Option<Arc<dyn ModelRuntime>>,
    cache: PredictionCache,
    semaphore: Semaphore,
    timeout: Duration,
    ranges: FeatureRanges,
    min_confidence: f64,
    metrics: Arc<dyn MetricsSink>,
    counters: Counters,
}

impl MlGate {
    pub fn new(
        cfg: &MlConfig,
        ranges: FeatureRanges,
        runtime: Option<Arc<dyn ModelRuntime>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            runtime,
            cache: PredictionCache::new(cfg.cache_size, cfg.cache_ttl()),
            semaphore: Semaphore::new(cfg.max_concurrent_preds),
            timeout: cfg.timeout(),
            ranges,
            min_confidence: cfg.min_confidence,
            metrics,
            counters: Counters::default(),
        }
    }

    /// True iff the positive-class probability exceeds `threshold`.
    pub async fn approve(&self, features: &FeatureVector, threshold: f64) -> bool {
        let probs = self.predict(features).await;
        probs[1] > threshold
    }

    /// Class probabilities for one feature vector. Infallible by design —
    /// every failure mode resolves to the fallback heuristic.
    pub async fn predict(&self, features: &FeatureVector) -> [f64; 2] {
        if let Err(reason) = self.validate_input(features) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            self.metrics.incr_counter(names::ML_FAILURES, 1);
            debug!(%reason, "feature validation failed — using fallback");
            return self.fallback(features);
        }

        if let Some(probs) = self.cache.get(features.as_slice()) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return probs;
        }

        let runtime = match &self.runtime {
            Some(rt) => Arc::clone(rt),
            None => return self.fallback(features),
        };

        // Concurrency cap: over the limit we answer immediately from the
        // fallback rather than queueing stale decisions.
        let permit = match self.semaphore.try_acquire() {
            Ok(p) => p,
            Err(_) => {
                self.counters.overloads.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ML_OVERLOADS, 1);
                return self.fallback(features);
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, runtime.predict(features.as_slice())).await;
        drop(permit);

        let probs = match outcome {
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ML_TIMEOUTS, 1);
                warn!(timeout_ms = self.timeout.as_millis() as u64, "inference deadline exceeded");
                return self.fallback(features);
            }
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ML_FAILURES, 1);
                self.metrics.observe_call(false);
                warn!(error = %e, runtime = runtime.name(), "inference failed");
                return self.fallback(features);
            }
            Ok(Ok(probs)) => probs,
        };

        let probs = match Self::validate_output(&probs) {
            Ok(p) => p,
            Err(reason) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ML_FAILURES, 1);
                warn!(%reason, "model output rejected — using fallback");
                return self.fallback(features);
            }
        };

        self.counters.predictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter(names::ML_PREDICTIONS, 1);
        self.metrics
            .record_histogram(names::ML_LATENCY, started.elapsed().as_secs_f64());
        self.metrics
            .record_histogram(names::ML_PREDICTION_SCORES, probs[1]);
        self.metrics.observe_call(true);

        if probs[1] < self.min_confidence {
            debug!(p1 = probs[1], min_confidence = self.min_confidence, "low-confidence prediction");
        }

        self.cache.insert(features.as_slice(), probs);
        probs
    }

    /// Snapshot for the state endpoint.
    pub fn stats(&self) -> MlGateStats {
        MlGateStats {
            predictions: self.counters.predictions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            overloads: self.counters.overloads.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_len: self.cache.len(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn validate_input(&self, features: &FeatureVector) -> Result<(), String> {
        if let Some(rt) = &self.runtime {
            if rt.dimension() != FEATURE_DIMENSION {
                return Err(format!(
                    "model expects {} features, engine produces {}",
                    rt.dimension(),
                    FEATURE_DIMENSION
                ));
            }
        }

        for (i, value) in features.as_slice().iter().enumerate() {
            if !value.is_finite() {
                return Err(format!("feature[{i}] is not finite: {value}"));
            }
            let (lo, hi) = self.ranges.bounds(i);
            if *value < lo || *value > hi {
                return Err(format!("feature[{i}]={value} outside [{lo}, {hi}]"));
            }
        }
        Ok(())
    }

    fn validate_output(probs: &[f64]) -> Result<[f64; 2], String> {
        if probs.len() != 2 {
            return Err(format!("expected 2 probabilities, got {}", probs.len()));
        }
        let (p0, p1) = (probs[0], probs[1]);
        if !p0.is_finite() || !p1.is_finite() {
            return Err(format!("non-finite probabilities [{p0}, {p1}]"));
        }
        if !(0.0..=1.0).contains(&p1) || !(0.0..=1.0).contains(&p0) {
            return Err(format!("probabilities outside [0, 1]: [{p0}, {p1}]"));
        }
        Ok([p0, p1])
    }

    fn fallback(&self, features: &FeatureVector) -> [f64; 2] {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter(names::ML_FALLBACK_USES, 1);
        let score = fallback_score(features).clamp(0.0, 1.0);
        [1.0 - score, score]
    }
}

/// Deterministic, state-free scorer used whenever the model cannot answer.
pub fn fallback_score(features: &FeatureVector) -> f64 {
    let mut score = FALLBACK_BASE;

    let tick = features.tick_ratio();
    if tick > TICK_STRONG {
        score += TICK_ADJUST;
    } else if tick < -TICK_STRONG {
        score -= TICK_ADJUST;
    }

    let depth = features.depth_ratio();
    if depth > DEPTH_STRONG {
        score += DEPTH_ADJUST;
    } else if depth < -DEPTH_STRONG {
        score -= DEPTH_ADJUST;
    }

    let dist = features.price_distance().abs();
    if dist > DIST_SWEET_LOW && dist < DIST_SWEET_HIGH {
        score += DIST_SWEET_BONUS;
    } else if dist > DIST_SWEET_HIGH {
        score -= DIST_EXTREME_PENALTY;
    }

    score
}

/// Background sweep of expired cache entries, every TTL/2.
pub fn spawn_cache_cleaner(
    gate: Arc<MlGate>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = (gate.cache.ttl() / 2).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = gate.cache.purge_expired();
                    if removed > 0 {
                        debug!(removed, "prediction cache cleaned");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("cache cleaner stopping");
                    return;
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;
    use anyhow::Result;
    use async_trait::async_trait;

    fn gate_cfg() -> MlConfig {
        MlConfig {
            timeout_ms: 100,
            ..MlConfig::default()
        }
    }

    fn fallback_gate() -> MlGate {
        MlGate::new(
            &gate_cfg(),
            FeatureRanges::default(),
            None,
            Arc::new(NullSink::new()),
        )
    }

    struct FixedRuntime {
        probs: Vec<f64>,
        calls: AtomicU64,
    }

    impl FixedRuntime {
        fn new(probs: Vec<f64>) -> Self {
            Self {
                probs,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelRuntime for FixedRuntime {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn dimension(&self) -> usize {
            FEATURE_DIMENSION
        }
        async fn predict(&self, _features: &[f64]) -> Result<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.probs.clone())
        }
    }

    struct SlowRuntime;

    #[async_trait]
    impl ModelRuntime for SlowRuntime {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn dimension(&self) -> usize {
            FEATURE_DIMENSION
        }
        async fn predict(&self, _features: &[f64]) -> Result<Vec<f64>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![0.1, 0.9])
        }
    }

    #[test]
    fn fallback_score_matches_contract() {
        // 0.5 + 0.2 (tick) + 0.15 (depth) + 0.3 (sweet-spot distance) = 1.15
        let f = FeatureVector::new(0.5, 0.3, 2.0);
        assert!((fallback_score(&f) - 1.15).abs() < 1e-12);

        // All-adverse features: 0.5 - 0.2 - 0.15 - 0.4 = -0.25
        let f = FeatureVector::new(-0.5, -0.3, 4.0);
        assert!((fallback_score(&f) + 0.25).abs() < 1e-12);

        // Neutral features stay at base.
        let f = FeatureVector::new(0.0, 0.0, 0.0);
        assert!((fallback_score(&f) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fallback_approves_strong_signal_over_half() {
        // Strong tick + depth + sweet-spot distance: 0.5+0.2+0.15+0.3 = 1.15.
        let gate = fallback_gate();
        let f = FeatureVector::new(0.5, 0.3, 2.0);
        assert!(gate.approve(&f, 0.5).await);
    }

    #[tokio::test]
    async fn threshold_one_never_approves() {
        let gate = fallback_gate();
        let f = FeatureVector::new(0.5, 0.3, 2.0);
        assert!(!gate.approve(&f, 1.0).await, "p1 is clamped to 1.0, never > 1.0");
    }

    #[tokio::test]
    async fn model_path_approves_at_zero_threshold() {
        let rt = Arc::new(
            NativeRuntime::from_artifact(ModelArtifact {
                dimension: 3,
                weights: vec![0.0, 0.0, 0.0],
                bias: -20.0, // p1 tiny but strictly positive
            })
            .unwrap(),
        );
        let gate = MlGate::new(
            &gate_cfg(),
            FeatureRanges::default(),
            Some(rt),
            Arc::new(NullSink::new()),
        );
        let f = FeatureVector::new(0.0, 0.0, 0.0);
        assert!(gate.approve(&f, 0.0).await, "sigmoid output is strictly > 0");
    }

    #[tokio::test]
    async fn out_of_range_features_fall_back() {
        let rt = Arc::new(FixedRuntime::new(vec![0.0, 1.0]));
        let gate = MlGate::new(
            &gate_cfg(),
            FeatureRanges::default(),
            Some(rt.clone()),
            Arc::new(NullSink::new()),
        );

        // price_distance outside the default ±5 bound.
        let f = FeatureVector::new(0.0, 0.0, 7.5);
        let probs = gate.predict(&f).await;
        assert_eq!(rt.calls.load(Ordering::SeqCst), 0, "model must not be called");
        assert!((probs[1] - 0.5).abs() < 1e-12, "neutral fallback expected");
        assert_eq!(gate.stats().failures, 1);
        assert_eq!(gate.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn nan_features_fall_back() {
        let gate = fallback_gate();
        let f = FeatureVector::new(f64::NAN, 0.0, 0.0);
        let probs = gate.predict(&f).await;
        assert!(probs[1].is_finite());
        assert_eq!(gate.stats().failures, 1);
    }

    #[tokio::test]
    async fn identical_inputs_hit_the_cache() {
        let rt = Arc::new(FixedRuntime::new(vec![0.3, 0.7]));
        let gate = MlGate::new(
            &gate_cfg(),
            FeatureRanges::default(),
            Some(rt.clone()),
            Arc::new(NullSink::new()),
        );

        let f = FeatureVector::new(0.1, 0.2, 1.0);
        let first = gate.predict(&f).await;
        let second = gate.predict(&f).await;

        assert_eq!(first, second, "cached score must be identical");
        assert_eq!(rt.calls.load(Ordering::SeqCst), 1, "second call is a cache hit");
        assert_eq!(gate.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn deadline_exceeded_falls_back() {
        let mut cfg = gate_cfg();
        cfg.timeout_ms = 10;
        let gate = MlGate::new(
            &cfg,
            FeatureRanges::default(),
            Some(Arc::new(SlowRuntime)),
            Arc::new(NullSink::new()),
        );

        let f = FeatureVector::new(0.0, 0.0, 0.0);
        let probs = gate.predict(&f).await;
        assert!((probs[1] - 0.5).abs() < 1e-12);
        assert_eq!(gate.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn invalid_model_output_falls_back() {
        for bad in [vec![0.5], vec![0.5, f64::NAN], vec![0.5, 1.5], vec![-0.1, 0.9]] {
            let gate = MlGate::new(
                &gate_cfg(),
                FeatureRanges::default(),
                Some(Arc::new(FixedRuntime::new(bad))),
                Arc::new(NullSink::new()),
            );
            let f = FeatureVector::new(0.0, 0.0, 0.0);
            let probs = gate.predict(&f).await;
            assert!((probs[1] - 0.5).abs() < 1e-12, "fallback expected");
            assert_eq!(gate.stats().failures, 1);
        }
    }

    #[tokio::test]
    async fn over_capacity_returns_fallback_immediately() {
        let mut cfg = gate_cfg();
        cfg.max_concurrent_preds = 1;
        cfg.timeout_ms = 5_000;
        let gate = Arc::new(MlGate::new(
            &cfg,
            FeatureRanges::default(),
            Some(Arc::new(SlowRuntime)),
            Arc::new(NullSink::new()),
        ));

        // Occupy the only permit with a slow inference.
        let busy = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let f = FeatureVector::new(0.0, 0.0, 0.0);
                gate.predict(&f).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second caller must not queue: instant fallback + overload count.
        let started = Instant::now();
        let f = FeatureVector::new(0.9, 0.0, 0.0);
        let probs = gate.predict(&f).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!((probs[1] - 0.7).abs() < 1e-12, "tick>0.3 fallback = 0.7");
        assert_eq!(gate.stats().overloads, 1);

        busy.abort();
    }
}
