// =============================================================================
// OVIR-X — ML-gated mean reversion on order-flow and VWAP displacement
// =============================================================================
//
// Fade the displacement: when price sits above VWAP, sell; below, buy. The
// ML gate (or its fallback heuristic) decides whether the microstructure
// supports the reversion. Exits are installed with the open: stop-loss at
// 1.5 sigma beyond entry, take-profit back at VWAP, and a trailing stop one
// sigma wide.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::executor::{ExecutionOutcome, Executor, ExitPlan};
use crate::features::FeatureVector;
use crate::ml::MlGate;
use crate::strategy::{Strategy, TickContext};
use crate::types::{EngineError, Side};

/// Stop-loss distance in units of window sigma.
const STOP_SIGMA: f64 = 1.5;

pub struct OvirX {
    gate: Arc<MlGate>,
    prob_threshold: f64,
    max_price_distance: f64,
}

impl OvirX {
    pub fn new(gate: Arc<MlGate>, prob_threshold: f64, max_price_distance: f64) -> Self {
        Self {
            gate,
            prob_threshold,
            max_price_distance,
        }
    }
}

#[async_trait]
impl Strategy for OvirX {
    fn name(&self) -> &'static str {
        "ovir-x"
    }

    async fn execute(&self, exec: &Executor, tick: &TickContext) -> Result<(), EngineError> {
        let dist = match tick.price_distance() {
            Some(d) => d,
            None => return Ok(()), // window has no spread yet
        };

        if dist.abs() > self.max_price_distance {
            debug!(symbol = %tick.symbol, dist, "displacement beyond sane range — skipping");
            return Ok(());
        }

        let features = FeatureVector::new(tick.tick_imbalance, tick.depth_imbalance, dist);
        if !self.gate.approve(&features, self.prob_threshold).await {
            debug!(symbol = %tick.symbol, dist, "ml gate rejected entry");
            return Ok(());
        }

        let side = if dist > 0.0 { Side::Sell } else { Side::Buy };

        let plan = ExitPlan {
            stop_price: Some(tick.price - side.sign() * STOP_SIGMA * tick.std),
            take_price: Some(tick.vwap),
            trailing_distance: Some(tick.std),
        };

        let outcome = exec.open_position(&tick.symbol, side, tick.price, plan).await;
        debug!(
            symbol = %tick.symbol,
            %side,
            dist,
            outcome = %outcome,
            "ovir-x evaluated"
        );

        if let ExecutionOutcome::Failed(reason) = outcome {
            return Err(EngineError::Transient(reason));
        }
        Ok(())
    }
}
