// =============================================================================
// Mean Reversion — rule-based two-sigma fade, no model in the loop
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::executor::{ExecutionOutcome, Executor, ExitPlan};
use crate::strategy::{Strategy, TickContext};
use crate::types::{EngineError, Side};

/// Minimum |z-score| before the fade triggers.
const MIN_DISTANCE: f64 = 2.0;

pub struct MeanReversion;

#[async_trait]
impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "mean-reversion"
    }

    async fn execute(&self, exec: &Executor, tick: &TickContext) -> Result<(), EngineError> {
        let dist = match tick.price_distance() {
            Some(d) => d,
            None => return Ok(()),
        };

        if dist.abs() < MIN_DISTANCE {
            return Ok(());
        }

        let side = if dist > 0.0 { Side::Sell } else { Side::Buy };

        // Plain market entry: no protective orders, no trailing.
        let outcome = exec
            .open_position(&tick.symbol, side, tick.price, ExitPlan::none())
            .await;
        debug!(symbol = %tick.symbol, %side, dist, outcome = %outcome, "mean-reversion evaluated");

        if let ExecutionOutcome::Failed(reason) = outcome {
            return Err(EngineError::Transient(reason));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_two_sigma() {
        assert!((MIN_DISTANCE - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fade_side_opposes_displacement() {
        let side_for = |dist: f64| if dist > 0.0 { Side::Sell } else { Side::Buy };
        assert_eq!(side_for(2.5), Side::Sell);
        assert_eq!(side_for(-2.5), Side::Buy);
    }
}
