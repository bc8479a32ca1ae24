// =============================================================================
// Prediction Cache — quantized-key LRU with per-entry TTL
// =============================================================================
//
// Keys are a hash of the feature vector quantized to 1e-4, so two ticks that
// differ below feature resolution share an entry. LRU bounds memory; TTL
// bounds staleness; the cleaner loop (gate-owned) sweeps expired entries at
// TTL/2 so dead entries cannot pin the LRU.
// =============================================================================

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Quantization step for cache keys.
const KEY_QUANTUM: f64 = 1e-4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    probs: [f64; 2],
    stored_at: Instant,
}

/// Thread-safe LRU + TTL cache of model outputs.
pub struct PredictionCache {
    inner: Mutex<LruCache<u64, Entry>>,
    ttl: Duration,
}

impl PredictionCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Stable key for a feature vector, quantized to [`KEY_QUANTUM`].
    pub fn key(features: &[f64]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for f in features {
            let q = (f / KEY_QUANTUM).round() as i64;
            q.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Fresh cached probabilities, or None on miss/expiry. Expired entries
    /// are evicted on the spot.
    pub fn get(&self, features: &[f64]) -> Option<[f64; 2]> {
        let key = Self::key(features);
        let mut cache = self.inner.lock();

        match cache.get(&key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.probs),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, features: &[f64], probs: [f64; 2]) {
        let key = Self::key(features);
        self.inner.lock().put(
            key,
            Entry {
                probs,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry; returns how many were removed. Called by the
    /// cleaner loop at TTL/2.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.inner.lock();
        let expired: Vec<u64> = cache
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > self.ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
