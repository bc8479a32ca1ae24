// =============================================================================
// Order routing — per-symbol serialized submissions over the shared client
// =============================================================================
//
// Submissions for one symbol go through that symbol's async mutex so a pair
// of orders from the same tick can never reach the exchange inverted. Orders
// on different symbols are not ordered relative to each other.
// =============================================================================

pub mod client;
pub mod tracker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

pub use client::{OrderClient, OrderRequest, PaperClient, PaperFillMode, PlacedOrder, RestClient};
pub use tracker::{OrderRecord, OrderTracker};

use crate::types::OrderStatus;

/// Wraps the order client with per-symbol submission locks and the
/// configured request timeout.
pub struct OrderRouter {
    client: Arc<dyn OrderClient>,
    timeout: Duration,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OrderRouter {
    pub fn new(client: Arc<dyn OrderClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Submit an order, serialized with every other submission on the same
    /// symbol.
    pub async fn submit(&self, req: &OrderRequest) -> Result<PlacedOrder> {
        let lock = self.symbol_lock(&req.symbol);
        let _guard = lock.lock().await;
        self.client.place_with_timeout(req, self.timeout).await
    }

    pub async fn cancel(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        self.client.cancel(symbol, client_order_id).await
    }

    pub async fn status(&self, symbol: &str, client_order_id: &str) -> Result<OrderStatus> {
        self.client.status(symbol, client_order_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Side, TradeSide};

    fn req(symbol: &str, id: &str) -> OrderRequest {
        OrderRequest {
            symbol: symbol.into(),
            side: Side::Buy,
            trade_side: TradeSide::Open,
            qty: "1".into(),
            order_type: OrderType::Market,
            stop_price: None,
            client_order_id: id.into(),
        }
    }

    #[tokio::test]
    async fn submissions_pass_through_to_client() {
        let paper = Arc::new(PaperClient::new());
        let router = OrderRouter::new(paper.clone(), Duration::from_secs(1));

        router.submit(&req("BTCUSDT", "o1")).await.unwrap();
        router.submit(&req("BTCUSDT", "o2")).await.unwrap();
        assert_eq!(paper.order_count(), 2);
        assert_eq!(
            router.status("BTCUSDT", "o1").await.unwrap(),
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn same_symbol_submissions_serialize() {
        let paper = Arc::new(PaperClient::new());
        let router = Arc::new(OrderRouter::new(paper.clone(), Duration::from_secs(1)));

        // Hold the BTC lock, then race a BTC and an ETH submission: the ETH
        // one completes, the BTC one stays queued behind the guard.
        let btc_lock = router.symbol_lock("BTCUSDT");
        let guard = btc_lock.lock().await;

        let btc = {
            let router = router.clone();
            tokio::spawn(async move { router.submit(&req("BTCUSDT", "b1")).await })
        };
        let eth = {
            let router = router.clone();
            tokio::spawn(async move { router.submit(&req("ETHUSDT", "e1")).await })
        };

        eth.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(paper.orders_for("BTCUSDT").len(), 0, "BTC held by lock");
        assert_eq!(paper.orders_for("ETHUSDT").len(), 1);

        drop(guard);
        btc.await.unwrap().unwrap();
        assert_eq!(paper.orders_for("BTCUSDT").len(), 1);
    }
}
