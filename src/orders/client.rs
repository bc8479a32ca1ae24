// =============================================================================
// Order clients — HMAC-SHA256 signed REST client and in-memory paper client
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Signed requests
// carry the API key as a header and an HMAC-SHA256 hex signature over the
// query string, with a recvWindow to tolerate minor clock drift.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::types::{OrderStatus, OrderType, Side, TradeSide};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// A fully specified order submission. Quantity travels as a stringified
/// decimal — the exchange rejects float artifacts like 0.30000000000000004.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub trade_side: TradeSide,
    pub qty: String,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    /// Client-supplied idempotency key; reused verbatim on retry.
    pub client_order_id: String,
}

/// Acknowledgement returned by a successful placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
}

/// Exchange-facing order operations. Implementations are responsible for
/// auth signing and connection pooling; callers own retry policy.
#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn place_with_timeout(&self, req: &OrderRequest, timeout: Duration)
        -> Result<PlacedOrder>;
    async fn cancel(&self, symbol: &str, client_order_id: &str) -> Result<()>;
    async fn status(&self, symbol: &str, client_order_id: &str) -> Result<OrderStatus>;
}

// =============================================================================
// REST client
// =============================================================================

#[derive(Clone)]
pub struct RestClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    /// Build a client. `rest_timeout` is the transport-level ceiling; the
    /// per-call timeout passed to `place_with_timeout` may be tighter.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        rest_timeout: Duration,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(rest_timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (timestamp, recvWindow,
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }
}

#[async_trait]
impl OrderClient for RestClient {
    async fn place_with_timeout(
        &self,
        req: &OrderRequest,
        timeout: Duration,
    ) -> Result<PlacedOrder> {
        let mut params = format!(
            "symbol={}&side={}&tradeSide={}&qty={}&orderType={}&clientOrderId={}",
            req.symbol, req.side, req.trade_side, req.qty, req.order_type, req.client_order_id
        );
        if let Some(stop) = req.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v1/order?{}", self.base_url, qs);

        debug!(
            symbol = %req.symbol,
            side = %req.side,
            order_type = %req.order_type,
            qty = %req.qty,
            "placing order"
        );

        let resp = tokio::time::timeout(timeout, self.client.post(&url).send())
            .await
            .context("order placement deadline exceeded")?
            .context("POST /api/v1/order request failed")?;

        let body = Self::check(resp, "POST /api/v1/order").await?;

        let exchange_order_id = body
            .get("orderId")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_u64().map(|n| n.to_string())));

        info!(
            symbol = %req.symbol,
            client_order_id = %req.client_order_id,
            exchange_order_id = ?exchange_order_id,
            "order placed"
        );

        Ok(PlacedOrder {
            client_order_id: req.client_order_id.clone(),
            exchange_order_id,
        })
    }

    async fn cancel(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        let params = format!("symbol={symbol}&clientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v1/order?{}", self.base_url, qs);

        debug!(symbol, client_order_id, "cancelling order");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /api/v1/order request failed")?;

        Self::check(resp, "DELETE /api/v1/order").await?;
        debug!(symbol, client_order_id, "order cancelled");
        Ok(())
    }

    async fn status(&self, symbol: &str, client_order_id: &str) -> Result<OrderStatus> {
        let params = format!("symbol={symbol}&clientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v1/order request failed")?;

        let body = Self::check(resp, "GET /api/v1/order").await?;

        let status = match body.get("status").and_then(|v| v.as_str()) {
            Some("NEW") | Some("PARTIALLY_FILLED") => OrderStatus::Pending,
            Some("FILLED") => OrderStatus::Filled,
            Some("CANCELED") | Some("CANCELLED") | Some("EXPIRED") => OrderStatus::Cancelled,
            Some("REJECTED") => OrderStatus::Failed,
            other => {
                warn!(symbol, client_order_id, status = ?other, "unknown order status");
                OrderStatus::Pending
            }
        };

        Ok(status)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Paper client
// =============================================================================

/// How the paper client resolves placed orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperFillMode {
    /// Market orders fill immediately; stop/take orders stay pending.
    Immediate,
    /// Everything stays pending (used to exercise timeout/retry paths).
    Stalled,
    /// Every placement fails (used to exercise retry paths).
    Rejecting,
}

/// In-memory order simulator for dry-run mode and tests.
pub struct PaperClient {
    mode: PaperFillMode,
    orders: Mutex<HashMap<String, (OrderRequest, OrderStatus)>>,
}

impl PaperClient {
    pub fn new() -> Self {
        Self::with_mode(PaperFillMode::Immediate)
    }

    pub fn with_mode(mode: PaperFillMode) -> Self {
        Self {
            mode,
            orders: Mutex::new(HashMap::new()),
        }
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    /// Orders seen for `symbol`, oldest-first is not guaranteed.
    pub fn orders_for(&self, symbol: &str) -> Vec<OrderRequest> {
        self.orders
            .lock()
            .values()
            .filter(|(req, _)| req.symbol == symbol)
            .map(|(req, _)| req.clone())
            .collect()
    }

    /// Force a status, simulating an exchange-side transition.
    pub fn force_status(&self, client_order_id: &str, status: OrderStatus) {
        if let Some(entry) = self.orders.lock().get_mut(client_order_id) {
            entry.1 = status;
        }
    }
}

impl Default for PaperClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderClient for PaperClient {
    async fn place_with_timeout(
        &self,
        req: &OrderRequest,
        _timeout: Duration,
    ) -> Result<PlacedOrder> {
        if self.mode == PaperFillMode::Rejecting {
            anyhow::bail!("paper client rejecting order {}", req.client_order_id);
        }

        let status = match (self.mode, req.order_type) {
            (PaperFillMode::Immediate, OrderType::Market) => OrderStatus::Filled,
            _ => OrderStatus::Pending,
        };

        self.orders
            .lock()
            .insert(req.client_order_id.clone(), (req.clone(), status));

        debug!(
            symbol = %req.symbol,
            side = %req.side,
            qty = %req.qty,
            order_type = %req.order_type,
            "paper fill"
        );

        Ok(PlacedOrder {
            client_order_id: req.client_order_id.clone(),
            exchange_order_id: Some(format!("paper-{}", req.client_order_id)),
        })
    }

    async fn cancel(&self, _symbol: &str, client_order_id: &str) -> Result<()> {
        let mut orders = self.orders.lock();
        match orders.get_mut(client_order_id) {
            Some(entry) if entry.1 == OrderStatus::Pending => {
                entry.1 = OrderStatus::Cancelled;
                Ok(())
            }
            Some(_) => anyhow::bail!("order {client_order_id} is not pending"),
            None => anyhow::bail!("unknown order {client_order_id}"),
        }
    }

    async fn status(&self, _symbol: &str, client_order_id: &str) -> Result<OrderStatus> {
        self.orders
            .lock()
            .get(client_order_id)
            .map(|(_, status)| *status)
            .with_context(|| format!("unknown order {client_order_id}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn market_req(id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            trade_side: TradeSide::Open,
            qty: "0.010".into(),
            order_type: OrderType::Market,
            stop_price: None,
            client_order_id: id.into(),
        }
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let c = RestClient::new("key", "secret", "https://x.invalid", Duration::from_secs(5));
        let sig1 = c.sign("symbol=BTCUSDT&qty=1");
        let sig2 = c.sign("symbol=BTCUSDT&qty=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64, "HMAC-SHA256 hex is 64 chars");
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));

        // Different payloads produce different signatures.
        assert_ne!(sig1, c.sign("symbol=BTCUSDT&qty=2"));
    }

    #[test]
    fn debug_never_leaks_credentials() {
        let c = RestClient::new("k3y", "s3cret", "https://x.invalid", Duration::from_secs(5));
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("k3y"));
        assert!(!dbg.contains("s3cret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[tokio::test]
    async fn paper_market_orders_fill_immediately() {
        let client = PaperClient::new();
        let ack = client
            .place_with_timeout(&market_req("a1"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ack.client_order_id, "a1");
        assert_eq!(
            client.status("BTCUSDT", "a1").await.unwrap(),
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn paper_stop_orders_stay_pending_and_cancel() {
        let client = PaperClient::new();
        let mut req = market_req("s1");
        req.order_type = OrderType::StopLoss;
        req.stop_price = Some(95.0);

        client
            .place_with_timeout(&req, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            client.status("BTCUSDT", "s1").await.unwrap(),
            OrderStatus::Pending
        );

        client.cancel("BTCUSDT", "s1").await.unwrap();
        assert_eq!(
            client.status("BTCUSDT", "s1").await.unwrap(),
            OrderStatus::Cancelled
        );

        // Cancelling a non-pending order errors.
        assert!(client.cancel("BTCUSDT", "s1").await.is_err());
    }

    #[tokio::test]
    async fn rejecting_mode_fails_placement() {
        let client = PaperClient::with_mode(PaperFillMode::Rejecting);
        let result = client
            .place_with_timeout(&market_req("r1"), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
        assert_eq!(client.order_count(), 0);
    }

    #[tokio::test]
    async fn unknown_orders_error_on_status_and_cancel() {
        let client = PaperClient::new();
        assert!(client.status("BTCUSDT", "nope").await.is_err());
        assert!(client.cancel("BTCUSDT", "nope").await.is_err());
    }
}
