// =============================================================================
// Feature Engine — per-symbol streaming microstructure state
// =============================================================================
//
// One engine per symbol, owned by that symbol's market-data path. Each engine
// serialises its own mutation behind short per-structure locks; the executor
// only ever sees by-value snapshots.
// =============================================================================

pub mod imbalance;
pub mod vwap;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::FeaturesConfig;
use crate::types::{DepthEvent, EngineError, TradeEvent};

pub use imbalance::{depth_imbalance, TickImbalance};
pub use vwap::{VwapSnapshot, VwapWindow};

/// The three model features, in wire order.
pub const FEATURE_DIMENSION: usize = 3;

/// Validated model input: [tick_ratio, depth_ratio, price_distance].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_DIMENSION]);

impl FeatureVector {
    pub fn new(tick_ratio: f64, depth_ratio: f64, price_distance: f64) -> Self {
        Self([tick_ratio, depth_ratio, price_distance])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn tick_ratio(&self) -> f64 {
        self.0[0]
    }

    pub fn depth_ratio(&self) -> f64 {
        self.0[1]
    }

    pub fn price_distance(&self) -> f64 {
        self.0[2]
    }
}

/// Last seen book depth for a symbol.
#[derive(Debug, Clone, Copy, Default)]
struct DepthSnapshot {
    bid_volume: f64,
    ask_volume: f64,
}

/// Point-in-time feature state handed to strategies.
#[derive(Debug, Clone, Copy)]
pub struct FeatureState {
    pub vwap: f64,
    pub std: f64,
    pub count: usize,
    pub avg_volume: f64,
    pub tick_imbalance: f64,
    pub depth_imbalance: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
}

/// Streaming feature state for a single symbol.
pub struct FeatureEngine {
    symbol: String,
    vwap: VwapWindow,
    ticks: Mutex<TickImbalance>,
    depth: RwLock<DepthSnapshot>,
}

impl FeatureEngine {
    pub fn new(symbol: impl Into<String>, cfg: &FeaturesConfig) -> Self {
        Self {
            symbol: symbol.into(),
            vwap: VwapWindow::new(cfg.vwap_size, Duration::from_secs(cfg.vwap_window_secs)),
            ticks: Mutex::new(TickImbalance::new(cfg.tick_size)),
            depth: RwLock::new(DepthSnapshot::default()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Feed one trade. A rejected sample leaves the tick window untouched.
    pub fn on_trade(&self, event: &TradeEvent) -> Result<(), EngineError> {
        self.vwap.add(event.price, event.qty, event.side, event.ts)?;
        self.ticks.lock().add(event.side);
        Ok(())
    }

    /// Feed one depth update.
    pub fn on_depth(&self, event: &DepthEvent) {
        let mut depth = self.depth.write();
        depth.bid_volume = event.bid_volume;
        depth.ask_volume = event.ask_volume;
    }

    /// Snapshot of all features, consistent per underlying structure.
    pub fn state(&self) -> FeatureState {
        let snap = self.vwap.calc();
        let tick = self.ticks.lock().ratio();
        let depth = *self.depth.read();

        FeatureState {
            vwap: snap.vwap,
            std: snap.std,
            count: snap.count,
            avg_volume: snap.avg_volume,
            tick_imbalance: tick,
            depth_imbalance: depth_imbalance(depth.bid_volume, depth.ask_volume),
            bid_volume: depth.bid_volume,
            ask_volume: depth.ask_volume,
        }
    }

    /// Empty all windows, reusing backing storage.
    pub fn reset(&self) {
        self.vwap.reset();
        self.ticks.lock().reset();
        *self.depth.write() = DepthSnapshot::default();
    }

    pub fn rejected_samples(&self) -> u64 {
        self.vwap.rejected_samples()
    }
}

// =============================================================================
// FeatureHub — per-symbol engine registry + feed liveness
// =============================================================================

/// Owns one `FeatureEngine` per configured symbol plus the last-activity
/// timestamp used by the feed-stall watchdog.
pub struct FeatureHub {
    engines: HashMap<String, Arc<FeatureEngine>>,
    last_event: RwLock<Instant>,
}

impl FeatureHub {
    pub fn new(symbols: &[String], cfg: &FeaturesConfig) -> Self {
        let engines = symbols
            .iter()
            .map(|s| (s.clone(), Arc::new(FeatureEngine::new(s.clone(), cfg))))
            .collect();
        Self {
            engines,
            last_event: RwLock::new(Instant::now()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<FeatureEngine>> {
        self.engines.get(symbol).cloned()
    }

    /// Record feed activity (called by both stream consumers).
    pub fn touch(&self) {
        *self.last_event.write() = Instant::now();
    }

    /// Time since the last market-data event on any symbol.
    pub fn idle_for(&self) -> Duration {
        self.last_event.read().elapsed()
    }
}
