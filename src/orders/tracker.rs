// =============================================================================
// Order Tracker — deadlines, retries, and cancel-on-timeout
// =============================================================================
//
// Every placed order is registered with a deadline. The sweeper walks the
// outstanding map on each tick:
//
//   filled/cancelled       -> evict
//   failed, attempts left  -> re-submit with the SAME client order id
//   pending past deadline  -> cancel; on success mark timeout and evict
//
// The map holds only live orders — terminal statuses leave immediately, so
// the tracker is bounded by the number of genuinely outstanding orders.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::OrderExecConfig;
use crate::metrics::{names, MetricsSink};
use crate::orders::{OrderRequest, OrderRouter};
use crate::types::OrderStatus;

/// One outstanding order.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub request: OrderRequest,
    pub exchange_order_id: Option<String>,
    pub placed_at: DateTime<Utc>,
    pub deadline: Instant,
    pub status: OrderStatus,
    pub attempts: u32,
}

/// Serialisable tracker summary for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub outstanding: usize,
    pub timeouts: u64,
    pub retries: u64,
}

struct Counters {
    timeouts: std::sync::atomic::AtomicU64,
    retries: std::sync::atomic::AtomicU64,
}

/// Tracks outstanding orders and enforces the execution timeout.
pub struct OrderTracker {
    orders: RwLock<HashMap<String, OrderRecord>>,
    router: Arc<OrderRouter>,
    cfg: OrderExecConfig,
    metrics: Arc<dyn MetricsSink>,
    counters: Counters,
}

impl OrderTracker {
    pub fn new(router: Arc<OrderRouter>, cfg: OrderExecConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            router,
            cfg,
            metrics,
            counters: Counters {
                timeouts: std::sync::atomic::AtomicU64::new(0),
                retries: std::sync::atomic::AtomicU64::new(0),
            },
        }
    }

    /// Register a freshly placed order for lifecycle tracking.
    pub fn register(&self, request: OrderRequest, exchange_order_id: Option<String>) {
        let record = OrderRecord {
            deadline: Instant::now() + self.cfg.execution_timeout(),
            request,
            exchange_order_id,
            placed_at: Utc::now(),
            status: OrderStatus::Pending,
            attempts: 1,
        };

        debug!(
            client_order_id = %record.request.client_order_id,
            symbol = %record.request.symbol,
            "order registered"
        );
        self.orders
            .write()
            .insert(record.request.client_order_id.clone(), record);
    }

    pub fn outstanding(&self) -> usize {
        self.orders.read().len()
    }

    pub fn stats(&self) -> TrackerStats {
        use std::sync::atomic::Ordering;
        TrackerStats {
            outstanding: self.outstanding(),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// One sweep over the outstanding map. Snapshot first — no lock is held
    /// across any await.
    pub async fn sweep(&self) {
        let snapshot: Vec<(String, OrderRecord)> = self
            .orders
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (id, record) in snapshot {
            let symbol = record.request.symbol.clone();

            let status = match self.router.status(&symbol, &id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(client_order_id = %id, error = %e, "status query failed");
                    self.metrics.observe_call(false);
                    continue;
                }
            };

            match status {
                OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Timeout => {
                    debug!(client_order_id = %id, %status, "order reached terminal status");
                    self.orders.write().remove(&id);
                }
                OrderStatus::Failed => {
                    if record.attempts < self.cfg.max_order_retries {
                        self.retry(&id, &record).await;
                    } else {
                        warn!(
                            client_order_id = %id,
                            attempts = record.attempts,
                            "order failed with retries exhausted"
                        );
                        self.orders.write().remove(&id);
                    }
                }
                OrderStatus::Pending => {
                    if Instant::now() >= record.deadline {
                        self.cancel_expired(&id, &symbol).await;
                    }
                }
            }
        }
    }

    async fn retry(&self, id: &str, record: &OrderRecord) {
        use std::sync::atomic::Ordering;

        info!(
            client_order_id = %id,
            attempt = record.attempts + 1,
            max = self.cfg.max_order_retries,
            "re-submitting failed order with the same idempotency key"
        );

        // The same client order id makes the re-submission idempotent on the
        // exchange side.
        match self.router.submit(&record.request).await {
            Ok(ack) => {
                let mut orders = self.orders.write();
                if let Some(rec) = orders.get_mut(id) {
                    rec.attempts += 1;
                    rec.exchange_order_id = ack.exchange_order_id;
                    rec.deadline = Instant::now() + self.cfg.execution_timeout();
                    rec.status = OrderStatus::Pending;
                }
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ORDER_RETRIES, 1);
                self.metrics.observe_call(true);
            }
            Err(e) => {
                warn!(client_order_id = %id, error = %e, "retry submission failed");
                self.metrics.observe_call(false);
                let mut orders = self.orders.write();
                let exhausted = match orders.get_mut(id) {
                    Some(rec) => {
                        rec.attempts += 1;
                        rec.attempts >= self.cfg.max_order_retries
                    }
                    None => false,
                };
                if exhausted {
                    orders.remove(id);
                }
            }
        }
    }

    async fn cancel_expired(&self, id: &str, symbol: &str) {
        use std::sync::atomic::Ordering;

        warn!(client_order_id = %id, symbol, "order past execution deadline — cancelling");

        match self.router.cancel(symbol, id).await {
            Ok(()) => {
                self.orders.write().remove(id);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(names::ORDER_TIMEOUTS, 1);
                info!(client_order_id = %id, "order cancelled on timeout");
            }
            Err(e) => {
                // Leave the record in place; the next sweep retries the
                // cancel (the exchange may have filled it meanwhile).
                warn!(client_order_id = %id, error = %e, "cancel failed, will retry next sweep");
                self.metrics.observe_call(false);
            }
        }
    }

    /// Sweeper loop. Runs until shutdown, then performs a final pass that
    /// cancels everything still outstanding.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cfg.status_check_interval());
        info!(
            interval_ms = self.cfg.status_check_interval().as_millis() as u64,
            "order tracker sweeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    info!(outstanding = self.outstanding(), "order tracker stopping");
                    self.cancel_all_outstanding().await;
                    return;
                }
            }
        }
    }

    /// Cancel every live order (shutdown path).
    pub async fn cancel_all_outstanding(&self) {
        let ids: Vec<(String, String)> = self
            .orders
            .read()
            .values()
            .map(|r| (r.request.client_order_id.clone(), r.request.symbol.clone()))
            .collect();

        for (id, symbol) in ids {
            if let Err(e) = self.router.cancel(&symbol, &id).await {
                warn!(client_order_id = %id, error = %e, "shutdown cancel failed");
            }
            self.orders.write().remove(&id);
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
    use crate::orders::{OrderClient, PaperClient, PaperFillMode};
    use crate::types::{OrderType, Side, TradeSide};
    use std::time::Duration;

    fn req(id: &str, order_type: OrderType) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            trade_side: TradeSide::Open,
            qty: "0.01".into(),
            order_type,
            stop_price: matches!(order_type, OrderType::StopLoss).then_some(95.0),
            client_order_id: id.into(),
        }
    }

    fn tracker_with(
        mode: PaperFillMode,
        execution_timeout_ms: u64,
        max_retries: u32,
    ) -> (Arc<OrderTracker>, Arc<PaperClient>) {
        let paper = Arc::new(PaperClient::with_mode(mode));
        let router = Arc::new(OrderRouter::new(paper.clone(), Duration::from_secs(1)));
        let cfg = OrderExecConfig {
            rest_timeout_ms: 1000,
            order_execution_timeout_ms: execution_timeout_ms,
            order_status_check_interval_ms: 10,
            max_order_retries: max_retries,
        };
        let tracker = Arc::new(OrderTracker::new(router, cfg, Arc::new(NullSink::new())));
        (tracker, paper)
    }

    async fn place_and_register(
        tracker: &OrderTracker,
        paper: &PaperClient,
        request: OrderRequest,
    ) {
        let ack = paper
            .place_with_timeout(&request, Duration::from_secs(1))
            .await
            .unwrap();
        tracker.register(request, ack.exchange_order_id);
    }

    #[tokio::test]
    async fn filled_orders_are_evicted() {
        let (tracker, paper) = tracker_with(PaperFillMode::Immediate, 30_000, 3);
        place_and_register(&tracker, &paper, req("f1", OrderType::Market)).await;
        assert_eq!(tracker.outstanding(), 1);

        tracker.sweep().await;
        assert_eq!(tracker.outstanding(), 0, "filled order must be evicted");
        assert_eq!(tracker.stats().timeouts, 0);
    }

    #[tokio::test]
    async fn pending_order_within_deadline_is_left_alone() {
        let (tracker, paper) = tracker_with(PaperFillMode::Stalled, 60_000, 3);
        place_and_register(&tracker, &paper, req("p1", OrderType::Market)).await;

        tracker.sweep().await;
        assert_eq!(tracker.outstanding(), 1, "deadline not reached yet");
    }

    #[tokio::test]
    async fn expired_pending_order_is_cancelled_and_counted() {
        let (tracker, paper) = tracker_with(PaperFillMode::Stalled, 0, 3);
        place_and_register(&tracker, &paper, req("t1", OrderType::Market)).await;

        // Deadline of 0 ms: the first sweep must cancel.
        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.sweep().await;

        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.stats().timeouts, 1);
        assert_eq!(
            paper.status("BTCUSDT", "t1").await.unwrap(),
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn failed_order_is_retried_with_same_id() {
        let (tracker, paper) = tracker_with(PaperFillMode::Stalled, 60_000, 3);
        place_and_register(&tracker, &paper, req("r1", OrderType::Market)).await;

        // Exchange reports a retryable failure.
        paper.force_status("r1", OrderStatus::Failed);
        tracker.sweep().await;

        assert_eq!(tracker.outstanding(), 1, "retried order stays tracked");
        assert_eq!(tracker.stats().retries, 1);
        // The paper client saw the same client order id again (re-insert).
        assert_eq!(paper.orders_for("BTCUSDT").len(), 1);
        assert_eq!(
            paper.status("BTCUSDT", "r1").await.unwrap(),
            OrderStatus::Pending,
            "re-submission resets the exchange status"
        );
    }

    #[tokio::test]
    async fn retries_exhaust_and_evict() {
        let (tracker, paper) = tracker_with(PaperFillMode::Stalled, 60_000, 2);
        place_and_register(&tracker, &paper, req("x1", OrderType::Market)).await;

        // First failure: attempts 1 -> retry (attempts becomes 2 == max).
        paper.force_status("x1", OrderStatus::Failed);
        tracker.sweep().await;
        assert_eq!(tracker.outstanding(), 1);

        // Second failure: attempts == max, record evicted.
        paper.force_status("x1", OrderStatus::Failed);
        tracker.sweep().await;
        assert_eq!(tracker.outstanding(), 0, "retries exhausted");
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_orders() {
        let (tracker, paper) = tracker_with(PaperFillMode::Stalled, 60_000, 3);
        place_and_register(&tracker, &paper, req("s1", OrderType::StopLoss)).await;
        place_and_register(&tracker, &paper, req("s2", OrderType::StopLoss)).await;
        assert_eq!(tracker.outstanding(), 2);

        tracker.cancel_all_outstanding().await;
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(
            paper.status("BTCUSDT", "s1").await.unwrap(),
            OrderStatus::Cancelled
        );
        assert_eq!(
            paper.status("BTCUSDT", "s2").await.unwrap(),
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn sweeper_loop_stops_on_shutdown() {
        let (tracker, _paper) = tracker_with(PaperFillMode::Immediate, 60_000, 3);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(tracker.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper must stop on shutdown")
            .unwrap();
    }
}
