// =============================================================================
// Strategies — pluggable decision policies over the per-tick feature state
// =============================================================================

pub mod mean_reversion;
pub mod ovir_x;

use async_trait::async_trait;

use crate::executor::Executor;
use crate::types::EngineError;

pub use mean_reversion::MeanReversion;
pub use ovir_x::OvirX;

/// Everything a strategy sees for one tick of one symbol.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub symbol: String,
    pub price: f64,
    pub vwap: f64,
    pub std: f64,
    pub tick_imbalance: f64,
    pub depth_imbalance: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
}

impl TickContext {
    /// Z-score of price against VWAP; None while the window has no spread.
    pub fn price_distance(&self) -> Option<f64> {
        if self.std <= 0.0 || !self.std.is_finite() {
            return None;
        }
        Some((self.price - self.vwap) / self.std)
    }
}

/// A decision policy. Strategies are side-effect-only on the executor: they
/// must route every placement through it (which applies the risk firewall)
/// and never hold state that the executor owns.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, exec: &Executor, tick: &TickContext) -> Result<(), EngineError>;
}
