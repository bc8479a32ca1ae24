// =============================================================================
// Risk Firewall — daily loss, exposure, and drawdown protection
// =============================================================================
//
// Three layers sit in front of every proposed trade, plus the circuit breaker
// which is evaluated here so callers get a single answer:
//
//   1. Daily loss      — -daily_pnl / initial_balance reaches the limit.
//   2. Max drawdown    — (peak - current) / peak reaches the limit; trading
//                        suspends until the day resets or a new peak is made.
//   3. Exposure        — |position + delta| * price exceeds the per-symbol
//                        notional cap. Trades that strictly reduce exposure
//                        are always allowed.
//
// The firewall owns the P&L state on the executor's behalf and resets it
// atomically when a new trading day is detected (UTC calendar-day change or
// 24 h elapsed, whichever comes first). Denials are policy decisions: they
// are logged at debug and surfaced as `(false, reason)`, never as errors.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::metrics::{names, MetricsSink};

/// Configured limits, fixed at construction.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Maximum daily loss as a fraction of initial balance.
    pub max_daily_loss: f64,
    /// Maximum drawdown from peak balance.
    pub max_drawdown: f64,
    /// Global notional exposure cap as a fraction of initial balance.
    pub max_exposure: f64,
    /// Per-symbol exposure overrides.
    pub exposure_overrides: HashMap<String, f64>,
}

impl RiskLimits {
    fn exposure_for(&self, symbol: &str) -> f64 {
        self.exposure_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.max_exposure)
    }
}

struct Inner {
    daily_pnl: f64,
    current_balance: f64,
    peak_balance: f64,
    day_start: DateTime<Utc>,
    drawdown_suspended: bool,
}

/// Serialisable risk snapshot for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RiskState {
    pub daily_pnl: f64,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub drawdown: f64,
    pub drawdown_suspended: bool,
    pub day_start: DateTime<Utc>,
}

/// The firewall. Shared via `Arc`; all mutation behind one RwLock.
pub struct RiskFirewall {
    inner: RwLock<Inner>,
    initial_balance: f64,
    limits: RiskLimits,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<dyn MetricsSink>,
}

impl RiskFirewall {
    pub fn new(
        initial_balance: f64,
        limits: RiskLimits,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        info!(
            initial_balance,
            max_daily_loss = limits.max_daily_loss,
            max_drawdown = limits.max_drawdown,
            max_exposure = limits.max_exposure,
            "risk firewall initialised"
        );

        Self {
            inner: RwLock::new(Inner {
                daily_pnl: 0.0,
                current_balance: initial_balance,
                peak_balance: initial_balance,
                day_start: Utc::now(),
                drawdown_suspended: false,
            }),
            initial_balance,
            limits,
            breaker,
            metrics,
        }
    }

    // -------------------------------------------------------------------------
    // P&L updates
    // -------------------------------------------------------------------------

    /// Apply a realised P&L delta. Balance, peak, and the drawdown latch are
    /// all updated in one critical section.
    pub fn update_pnl(&self, delta: f64) {
        self.update_pnl_at(delta, Utc::now());
    }

    fn update_pnl_at(&self, delta: f64, now: DateTime<Utc>) {
        self.maybe_reset_day(now);

        let mut s = self.inner.write();
        s.daily_pnl += delta;
        s.current_balance = self.initial_balance + s.daily_pnl;

        // A fresh peak ends a drawdown suspension; the peak itself only moves
        // up, never down, within a trading day.
        if s.drawdown_suspended && s.current_balance > s.peak_balance {
            info!(
                current = s.current_balance,
                old_peak = s.peak_balance,
                "new peak balance — drawdown suspension lifted"
            );
            s.drawdown_suspended = false;
        }
        if s.current_balance > s.peak_balance {
            s.peak_balance = s.current_balance;
        }

        let drawdown = Self::drawdown_of(&s);
        if !s.drawdown_suspended && drawdown >= self.limits.max_drawdown {
            warn!(
                drawdown = format!("{:.4}", drawdown),
                limit = self.limits.max_drawdown,
                "max drawdown reached — trading suspended until day reset"
            );
            s.drawdown_suspended = true;
        }

        let (pnl, dd) = (s.daily_pnl, drawdown);
        drop(s);

        debug!(delta, daily_pnl = pnl, "pnl updated");
        self.metrics.set_gauge(names::PNL_TOTAL, pnl);
        self.metrics.set_gauge(names::CURRENT_DRAWDOWN, dd);
    }

    // -------------------------------------------------------------------------
    // Pre-trade gates
    // -------------------------------------------------------------------------

    /// Account-level gate: daily loss, drawdown, and the circuit breaker.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.can_trade_at(Utc::now())
    }

    fn can_trade_at(&self, now: DateTime<Utc>) -> (bool, Option<String>) {
        self.maybe_reset_day(now);

        {
            let s = self.inner.read();

            let daily_loss = if self.initial_balance > 0.0 {
                (-s.daily_pnl) / self.initial_balance
            } else {
                0.0
            };
            if daily_loss >= self.limits.max_daily_loss {
                let msg = format!(
                    "daily loss limit reached: {:.2}% lost (limit {:.2}%)",
                    daily_loss * 100.0,
                    self.limits.max_daily_loss * 100.0
                );
                debug!("{}", msg);
                return (false, Some(msg));
            }

            let drawdown = Self::drawdown_of(&s);
            if s.drawdown_suspended || drawdown >= self.limits.max_drawdown {
                let msg = format!(
                    "drawdown protection active: {:.2}% from peak (limit {:.2}%)",
                    drawdown * 100.0,
                    self.limits.max_drawdown * 100.0
                );
                debug!("{}", msg);
                return (false, Some(msg));
            }
        }

        if self.breaker.is_tripped() {
            let msg = "circuit breaker tripped".to_string();
            debug!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    /// Symbol-level gate: the account gate plus the exposure limit for the
    /// proposed signed delta at `price`.
    pub fn can_trade_symbol(
        &self,
        symbol: &str,
        position: f64,
        delta: f64,
        price: f64,
    ) -> (bool, Option<String>) {
        let (ok, reason) = self.can_trade();
        if !ok {
            return (false, reason);
        }

        let current_notional = position.abs() * price;
        let new_notional = (position + delta).abs() * price;
        let limit = self.limits.exposure_for(symbol) * self.initial_balance;

        // Reducing exposure is always allowed, even over the limit.
        if new_notional < current_notional {
            return (true, None);
        }

        if new_notional > limit {
            let msg = format!(
                "exposure limit for {symbol}: {:.2} > {:.2} (position {:.6} delta {:.6} @ {:.2})",
                new_notional, limit, position, delta, price
            );
            debug!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn daily_pnl(&self) -> f64 {
        self.inner.read().daily_pnl
    }

    pub fn current_balance(&self) -> f64 {
        self.inner.read().current_balance
    }

    pub fn peak_balance(&self) -> f64 {
        self.inner.read().peak_balance
    }

    pub fn drawdown(&self) -> f64 {
        Self::drawdown_of(&self.inner.read())
    }

    pub fn snapshot(&self) -> RiskState {
        let s = self.inner.read();
        RiskState {
            daily_pnl: s.daily_pnl,
            initial_balance: self.initial_balance,
            current_balance: s.current_balance,
            peak_balance: s.peak_balance,
            drawdown: Self::drawdown_of(&s),
            drawdown_suspended: s.drawdown_suspended,
            day_start: s.day_start,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn drawdown_of(s: &Inner) -> f64 {
        if s.peak_balance > 0.0 {
            ((s.peak_balance - s.current_balance) / s.peak_balance).max(0.0)
        } else {
            0.0
        }
    }

    /// Detect a new trading day and reset atomically. Read-check first, then
    /// re-check under the write lock (another thread may have reset already).
    fn maybe_reset_day(&self, now: DateTime<Utc>) {
        {
            let s = self.inner.read();
            if !Self::day_rolled(s.day_start, now) {
                return;
            }
        }

        let mut s = self.inner.write();
        if Self::day_rolled(s.day_start, now) {
            info!(
                old_day_start = %s.day_start,
                new_day_start = %now,
                "new trading day — resetting daily risk state"
            );
            s.daily_pnl = 0.0;
            s.current_balance = self.initial_balance;
            s.peak_balance = self.initial_balance;
            s.day_start = now;
            s.drawdown_suspended = false;
        }
    }

    fn day_rolled(day_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let calendar_changed = day_start.ordinal() != now.ordinal() || day_start.year() != now.year();
        let elapsed_24h = now.signed_duration_since(day_start) >= chrono::Duration::hours(24);
        calendar_changed || elapsed_24h
    }
}

impl std::fmt::Debug for RiskFirewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskFirewall")
            .field("initial_balance", &self.initial_balance)
            .field("max_daily_loss", &self.limits.max_daily_loss)
            .field("max_drawdown", &self.limits.max_drawdown)
            .field("max_exposure", &self.limits.max_exposure)
            .finish()
    }
}
