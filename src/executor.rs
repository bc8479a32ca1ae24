// =============================================================================
// Executor — per-tick orchestration, positions, P&L, and order flow
// =============================================================================
//
// The executor owns the position book, the stop/take/trailing maps, and the
// strategy registry behind a single RwLock. Everything that mutates account
// state happens in one short critical section per event; no order submission
// or any other external call runs while the lock is held.
//
// Per tick: feature update -> trailing-stop maintenance -> circuit-breaker
// signals -> strategy fan-out. Strategy failures are swallowed, logged, and
// fed into the windowed error rate so the breaker can react; a failing
// strategy never aborts its siblings or the tick.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::breaker::{CircuitBreaker, LatchInfo};
use crate::config::Config;
use crate::features::FeatureHub;
use crate::metrics::{names, MetricsSink};
use crate::orders::{OrderRequest, OrderRouter, OrderTracker};
use crate::risk::{RiskFirewall, RiskState};
use crate::storage::{FeatureRecord, PriceRecord, StorageSink};
use crate::strategy::{Strategy, TickContext};
use crate::types::{DepthEvent, OrderType, Side, TradeEvent, TradeSide};

/// Exit orders installed together with an open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitPlan {
    pub stop_price: Option<f64>,
    pub take_price: Option<f64>,
    pub trailing_distance: Option<f64>,
}

impl ExitPlan {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Outcome of an entry or close attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Placed { qty: f64, client_order_id: String },
    Denied(String),
    Skipped(String),
    Failed(String),
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed { qty, client_order_id } => write!(f, "Placed(qty={qty}, id={client_order_id})"),
            Self::Denied(reason) => write!(f, "Denied({reason})"),
            Self::Skipped(reason) => write!(f, "Skipped({reason})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// A trailing stop attached to one open position.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrailingStop {
    pub initial_price: f64,
    pub stop_price: f64,
    pub distance: f64,
    pub side: Side,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct PositionEntry {
    /// Signed size: long > 0, short < 0.
    size: f64,
    entry_price: f64,
}

struct ExecutorState {
    positions: HashMap<String, PositionEntry>,
    stop_prices: HashMap<String, f64>,
    take_prices: HashMap<String, f64>,
    trailing: HashMap<String, TrailingStop>,
    strategies: BTreeMap<&'static str, Arc<dyn Strategy>>,
    trade_seq: HashMap<String, u64>,
}

/// Serialisable engine snapshot for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub server_time: DateTime<Utc>,
    pub trading_allowed: bool,
    pub positions: HashMap<String, PositionView>,
    pub trailing_stops: HashMap<String, TrailingStop>,
    pub risk: RiskState,
    pub circuit_breaker: Vec<LatchInfo>,
    pub outstanding_orders: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PositionView {
    pub size: f64,
    pub entry_price: f64,
}

pub struct Executor {
    config: Arc<Config>,
    features: Arc<FeatureHub>,
    firewall: Arc<RiskFirewall>,
    breaker: Arc<CircuitBreaker>,
    router: Arc<OrderRouter>,
    tracker: Arc<OrderTracker>,
    metrics: Arc<dyn MetricsSink>,
    audit: AuditLog,
    storage: Option<Arc<dyn StorageSink>>,
    state: RwLock<ExecutorState>,
    accepting: AtomicBool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        features: Arc<FeatureHub>,
        firewall: Arc<RiskFirewall>,
        breaker: Arc<CircuitBreaker>,
        router: Arc<OrderRouter>,
        tracker: Arc<OrderTracker>,
        metrics: Arc<dyn MetricsSink>,
        audit: AuditLog,
        storage: Option<Arc<dyn StorageSink>>,
    ) -> Self {
        Self {
            config,
            features,
            firewall,
            breaker,
            router,
            tracker,
            metrics,
            audit,
            storage,
            state: RwLock::new(ExecutorState {
                positions: HashMap::new(),
                stop_prices: HashMap::new(),
                take_prices: HashMap::new(),
                trailing: HashMap::new(),
                strategies: BTreeMap::new(),
                trade_seq: HashMap::new(),
            }),
            accepting: AtomicBool::new(true),
        }
    }

    /// Register a strategy. Iteration order is the BTreeMap's (by name), so
    /// fan-out order is deterministic for a given configuration.
    pub fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        let name = strategy.name();
        info!(strategy = name, "strategy registered");
        self.state.write().strategies.insert(name, strategy);
    }

    /// Stop accepting new ticks (first step of cooperative shutdown).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("executor no longer accepting ticks");
    }

    // =========================================================================
    // Event intake
    // =========================================================================

    /// Process one trade event end-to-end: features, trailing stops, breaker
    /// signals, strategy fan-out.
    pub async fn on_trade(&self, event: TradeEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        self.features.touch();

        let engine = match self.features.get(&event.symbol) {
            Some(e) => e,
            None => {
                warn!(symbol = %event.symbol, "trade for unconfigured symbol ignored");
                return;
            }
        };

        if let Err(e) = engine.on_trade(&event) {
            debug!(symbol = %event.symbol, error = %e, "sample rejected");
            self.metrics.incr_counter(names::FEATURE_REJECTS, 1);
            return;
        }

        if let Some(storage) = &self.storage {
            storage
                .store_price(PriceRecord {
                    symbol: event.symbol.clone(),
                    ts: event.ts,
                    price: event.price,
                    volume: event.qty,
                    side: event.side,
                })
                .await;
        }

        // Trailing stops see every tick, before any new entries.
        self.update_trailing(&event.symbol, event.price).await;

        let feat = engine.state();

        // Circuit-breaker market signals.
        let volatility = if feat.vwap > 0.0 { feat.std / feat.vwap } else { 0.0 };
        let volume_spike = if feat.avg_volume > 0.0 {
            event.qty / feat.avg_volume
        } else {
            0.0
        };
        self.breaker
            .update_market_conditions(volatility, feat.depth_imbalance, volume_spike);
        self.breaker.update_error_rate(self.metrics.error_rate());

        // Strategy trigger: every N accepted trades per symbol.
        let seq = {
            let mut state = self.state.write();
            let seq = state.trade_seq.entry(event.symbol.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        let trigger = self.config.trading.strategy_trigger_trades.max(1);
        if seq % trigger != 0 {
            return;
        }

        let ctx = TickContext {
            symbol: event.symbol.clone(),
            price: event.price,
            vwap: feat.vwap,
            std: feat.std,
            tick_imbalance: feat.tick_imbalance,
            depth_imbalance: feat.depth_imbalance,
            bid_volume: feat.bid_volume,
            ask_volume: feat.ask_volume,
        };

        if let Some(storage) = &self.storage {
            let dist = if feat.std > 0.0 {
                (event.price - feat.vwap) / feat.std
            } else {
                0.0
            };
            storage
                .store_features(FeatureRecord {
                    symbol: event.symbol.clone(),
                    ts: event.ts,
                    features: [feat.tick_imbalance, feat.depth_imbalance, dist],
                    vwap: feat.vwap,
                    std: feat.std,
                })
                .await;
        }

        // Clone the registry out of the lock: strategies run unlocked.
        let strategies: Vec<Arc<dyn Strategy>> =
            self.state.read().strategies.values().cloned().collect();

        for strategy in strategies {
            if let Err(e) = strategy.execute(self, &ctx).await {
                warn!(
                    strategy = strategy.name(),
                    symbol = %ctx.symbol,
                    error = %e,
                    "strategy failed — continuing with siblings"
                );
                self.metrics.observe_call(false);
            }
        }
    }

    /// Process one depth event.
    pub fn on_depth(&self, event: DepthEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        self.features.touch();

        if let Some(engine) = self.features.get(&event.symbol) {
            engine.on_depth(&event);
        }
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Risk-check, size, and place a market entry, then install the exit
    /// plan. Stop/take placement failures are logged and counted but the
    /// open is kept — the trailing stop still bounds the position.
    pub async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        plan: ExitPlan,
    ) -> ExecutionOutcome {
        if price <= 0.0 || !price.is_finite() {
            return ExecutionOutcome::Skipped(format!("unusable price {price}"));
        }

        let qty = self.position_size(symbol, price);
        if qty <= 0.0 {
            return ExecutionOutcome::Skipped("computed size is zero".to_string());
        }
        let delta = side.sign() * qty;

        let position = self
            .state
            .read()
            .positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(0.0);

        let (allowed, reason) = self
            .firewall
            .can_trade_symbol(symbol, position, delta, price);
        if !allowed {
            let reason = reason.unwrap_or_else(|| "risk denied".to_string());
            debug!(symbol, %side, qty, %reason, "entry denied by risk firewall");
            return ExecutionOutcome::Denied(reason);
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            trade_side: TradeSide::Open,
            qty: format_qty(qty, self.config.qty_step(symbol)),
            order_type: OrderType::Market,
            stop_price: None,
            client_order_id: Uuid::new_v4().to_string(),
        };

        let started = Instant::now();
        let result = self.router.submit(&request).await;
        self.metrics.record_histogram(
            names::ORDER_EXECUTION_DURATION,
            started.elapsed().as_secs_f64(),
        );

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                warn!(symbol, %side, qty, error = %e, "entry order failed");
                self.metrics
                    .incr_counter_with(names::ORDERS_TOTAL, ("result", "failed".into()), 1);
                self.metrics.observe_call(false);
                self.audit_order(&request, price, false, Some(e.to_string()));
                return ExecutionOutcome::Failed(e.to_string());
            }
        };

        self.tracker
            .register(request.clone(), ack.exchange_order_id.clone());

        // One transactional block: position, exits, trailing.
        let new_size = {
            let mut state = self.state.write();

            let entry = state
                .positions
                .entry(symbol.to_string())
                .or_insert(PositionEntry {
                    size: 0.0,
                    entry_price: price,
                });
            let old_size = entry.size;
            let new_size = old_size + delta;
            entry.entry_price = blended_entry(old_size, entry.entry_price, delta, price);
            entry.size = new_size;

            if let Some(stop) = plan.stop_price {
                state.stop_prices.insert(symbol.to_string(), stop);
            }
            if let Some(take) = plan.take_price {
                state.take_prices.insert(symbol.to_string(), take);
            }
            if let Some(distance) = plan.trailing_distance {
                state.trailing.insert(
                    symbol.to_string(),
                    TrailingStop {
                        initial_price: price,
                        stop_price: price - side.sign() * distance,
                        distance,
                        side,
                        last_update: Utc::now(),
                    },
                );
            }
            new_size
        };

        self.metrics
            .incr_counter_with(names::ORDERS_TOTAL, ("result", "placed".into()), 1);
        self.metrics
            .set_gauge_with(names::POSITIONS, ("symbol", symbol.to_string()), new_size);
        self.metrics.observe_call(true);
        self.audit_order(&request, price, true, None);

        info!(
            symbol,
            %side,
            qty,
            price,
            new_size,
            client_order_id = %request.client_order_id,
            "position opened"
        );

        // Protective orders ride after the open acknowledgement; their
        // failures are independent and never roll back the open.
        if let Some(stop) = plan.stop_price {
            self.place_protective(symbol, side, qty, OrderType::StopLoss, stop)
                .await;
        }
        if let Some(take) = plan.take_price {
            self.place_protective(symbol, side, qty, OrderType::TakeProfit, take)
                .await;
        }

        ExecutionOutcome::Placed {
            qty,
            client_order_id: request.client_order_id,
        }
    }

    async fn place_protective(
        &self,
        symbol: &str,
        open_side: Side,
        qty: f64,
        order_type: OrderType,
        trigger_price: f64,
    ) {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side: open_side.opposite(),
            trade_side: TradeSide::Close,
            qty: format_qty(qty, self.config.qty_step(symbol)),
            order_type,
            stop_price: Some(trigger_price),
            client_order_id: Uuid::new_v4().to_string(),
        };

        match self.router.submit(&request).await {
            Ok(ack) => {
                self.tracker.register(request.clone(), ack.exchange_order_id);
                self.metrics
                    .incr_counter_with(names::ORDERS_TOTAL, ("result", "placed".into()), 1);
                self.metrics.observe_call(true);
                debug!(symbol, %order_type, trigger_price, "protective order placed");
            }
            Err(e) => {
                // The open stays; the trailing stop still bounds it.
                warn!(symbol, %order_type, trigger_price, error = %e, "protective order failed");
                self.metrics
                    .incr_counter_with(names::ORDERS_TOTAL, ("result", "failed".into()), 1);
                self.metrics.observe_call(false);
                self.audit_order(&request, trigger_price, false, Some(e.to_string()));
            }
        }
    }

    // =========================================================================
    // Trailing stops and closes
    // =========================================================================

    /// Advance the trailing stop for `symbol` on a fresh price; close the
    /// position when the price crosses the stop.
    async fn update_trailing(&self, symbol: &str, price: f64) {
        let crossed = {
            let mut state = self.state.write();
            let ts = match state.trailing.get_mut(symbol) {
                Some(ts) => ts,
                None => return,
            };

            // Ratchet only once price has moved past the entry, and only in
            // the favourable direction.
            match ts.side {
                Side::Buy => {
                    if price > ts.initial_price {
                        ts.stop_price = ts.stop_price.max(price - ts.distance);
                    }
                }
                Side::Sell => {
                    if price < ts.initial_price {
                        ts.stop_price = ts.stop_price.min(price + ts.distance);
                    }
                }
            }
            ts.last_update = Utc::now();

            match ts.side {
                Side::Buy => price <= ts.stop_price,
                Side::Sell => price >= ts.stop_price,
            }
        };

        if crossed {
            info!(symbol, price, "trailing stop crossed — closing position");
            self.close_position(symbol, "trailing_stop", price).await;
        }
    }

    /// Market-close the whole position and purge its exit state atomically.
    pub async fn close_position(
        &self,
        symbol: &str,
        reason: &str,
        price: f64,
    ) -> ExecutionOutcome {
        let entry = match self.state.read().positions.get(symbol).copied() {
            Some(e) if e.size != 0.0 => e,
            _ => return ExecutionOutcome::Skipped("no open position".to_string()),
        };

        let side = if entry.size > 0.0 { Side::Sell } else { Side::Buy };
        let qty = entry.size.abs();

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            trade_side: TradeSide::Close,
            qty: format_qty(qty, self.config.qty_step(symbol)),
            order_type: OrderType::Market,
            stop_price: None,
            client_order_id: Uuid::new_v4().to_string(),
        };

        let started = Instant::now();
        let result = self.router.submit(&request).await;
        self.metrics.record_histogram(
            names::ORDER_EXECUTION_DURATION,
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(ack) => {
                self.tracker.register(request.clone(), ack.exchange_order_id);

                // Purge position + stop + take + trailing in one block.
                {
                    let mut state = self.state.write();
                    state.positions.remove(symbol);
                    state.stop_prices.remove(symbol);
                    state.take_prices.remove(symbol);
                    state.trailing.remove(symbol);
                }

                let pnl = entry.size * (price - entry.entry_price);
                self.firewall.update_pnl(pnl);

                self.metrics
                    .incr_counter_with(names::ORDERS_TOTAL, ("result", "placed".into()), 1);
                self.metrics
                    .set_gauge_with(names::POSITIONS, ("symbol", symbol.to_string()), 0.0);
                self.metrics.observe_call(true);
                self.audit_order(&request, price, true, None);

                info!(symbol, reason, price, pnl, "position closed");
                ExecutionOutcome::Placed {
                    qty,
                    client_order_id: request.client_order_id,
                }
            }
            Err(e) => {
                warn!(symbol, reason, error = %e, "close order failed — position kept");
                self.metrics
                    .incr_counter_with(names::ORDERS_TOTAL, ("result", "failed".into()), 1);
                self.metrics.observe_call(false);
                self.audit_order(&request, price, false, Some(e.to_string()));
                ExecutionOutcome::Failed(e.to_string())
            }
        }
    }

    // =========================================================================
    // P&L and sizing
    // =========================================================================

    /// Apply a realised P&L delta (fills feed, funding, fees).
    pub fn update_pnl(&self, delta: f64) {
        self.firewall.update_pnl(delta);
    }

    /// Kelly-capped position size in base units, floored to the lot step.
    pub fn position_size(&self, symbol: &str, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let t = &self.config.trading;
        let k = &t.kelly;

        let b = k.avg_win / k.avg_loss;
        let kelly = if b > 0.0 {
            ((k.win_rate * (b + 1.0) - 1.0) / b).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let half_kelly = kelly * 0.5;

        let qty = t.risk_usd * half_kelly * t.leverage / price;
        let cap = self.config.max_position_size(symbol) * t.risk_usd / price;
        let qty = qty.min(cap);

        let step = self.config.qty_step(symbol);
        (qty / step).floor() * step
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Signed position sizes per symbol.
    pub fn get_positions(&self) -> HashMap<String, f64> {
        self.state
            .read()
            .positions
            .iter()
            .map(|(s, p)| (s.clone(), p.size))
            .collect()
    }

    pub fn get_daily_pnl(&self) -> f64 {
        self.firewall.daily_pnl()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.read();
        let positions = state
            .positions
            .iter()
            .map(|(s, p)| {
                (
                    s.clone(),
                    PositionView {
                        size: p.size,
                        entry_price: p.entry_price,
                    },
                )
            })
            .collect();
        let trailing_stops = state.trailing.clone();
        drop(state);

        EngineSnapshot {
            server_time: Utc::now(),
            trading_allowed: self.firewall.can_trade().0,
            positions,
            trailing_stops,
            risk: self.firewall.snapshot(),
            circuit_breaker: self.breaker.snapshot(),
            outstanding_orders: self.tracker.outstanding(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn audit_order(&self, request: &OrderRequest, price: f64, ok: bool, error: Option<String>) {
        self.audit.record(AuditRecord {
            ts: Utc::now(),
            symbol: request.symbol.clone(),
            side: request.side,
            trade_side: request.trade_side,
            qty: request.qty.clone(),
            price,
            balance: self.firewall.current_balance(),
            daily_pnl: self.firewall.daily_pnl(),
            client_order_id: request.client_order_id.clone(),
            ok,
            error,
        });
    }
}

/// Volume-weighted entry price across adds; a flip to the other side starts
/// from the fill price.
fn blended_entry(old_size: f64, old_entry: f64, delta: f64, price: f64) -> f64 {
    let new_size = old_size + delta;
    if old_size == 0.0 || new_size == 0.0 || old_size.signum() != new_size.signum() {
        return price;
    }
    if old_size.signum() == delta.signum() {
        // Same-direction add: blend.
        (old_size.abs() * old_entry + delta.abs() * price) / new_size.abs()
    } else {
        // Partial reduction keeps the original basis.
        old_entry
    }
}

/// Decimal places needed so `step` prints exactly, capped at 8.
fn format_qty(qty: f64, step: f64) -> String {
    let mut decimals = 0usize;
    let mut scaled = step;
    while decimals < 8 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    format!("{qty:.decimals$}")
}
