// =============================================================================
// Trade stream — per-symbol WebSocket consumer feeding the executor
// =============================================================================
//
// Connects, subscribes to the symbol's trade channel, and pushes every parsed
// trade into the executor in arrival order. Returns on disconnect or error so
// the caller (main.rs) can reconnect with backoff; returns Ok(()) promptly on
// shutdown.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::executor::Executor;
use crate::types::{Side, TradeEvent};

/// Consume the trade stream for `symbol` until disconnect or shutdown.
pub async fn run_trade_stream(
    ws_url: &str,
    symbol: &str,
    executor: &Arc<Executor>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!(url = %ws_url, symbol, "connecting to trade stream");

    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to trade WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "channel": "trades",
        "symbol": symbol,
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to subscribe to trade channel")?;

    info!(symbol, "trade stream connected");

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_trade(&text) {
                        Ok(Some(event)) => executor.on_trade(event).await,
                        Ok(None) => {} // heartbeat / subscription ack
                        Err(e) => warn!(symbol, error = %e, "failed to parse trade message"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(symbol, error = %e, "trade stream read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, "trade stream ended");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => {
                debug!(symbol, "trade stream stopping on shutdown");
                return Ok(());
            }
        }
    }
}

/// Parse one trade frame. Returns Ok(None) for non-trade frames (acks,
/// heartbeats).
///
/// Expected shape:
/// ```json
/// { "channel": "trades", "symbol": "BTCUSDT", "price": "50123.5",
///   "qty": "0.004", "side": "buy", "ts": 1700000000123 }
/// ```
fn parse_trade(text: &str) -> Result<Option<TradeEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    if root.get("channel").and_then(|v| v.as_str()) != Some("trades") {
        return Ok(None);
    }

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_string();

    let price: f64 = parse_number(&root["price"]).context("missing or malformed field price")?;
    let qty: f64 = parse_number(&root["qty"]).context("missing or malformed field qty")?;

    let side = match root["side"].as_str() {
        Some("buy") | Some("BUY") => Side::Buy,
        Some("sell") | Some("SELL") => Side::Sell,
        other => anyhow::bail!("unknown side: {other:?}"),
    };

    let ts_ms = root["ts"].as_i64().context("missing field ts")?;
    let ts = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .context("timestamp out of range")?;

    Ok(Some(TradeEvent {
        symbol,
        price,
        qty,
        side,
        ts,
    }))
}

/// Exchanges send numbers as strings to dodge float truncation; accept both.
fn parse_number(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_trade_frame() {
        let text = r#"{"channel":"trades","symbol":"BTCUSDT","price":"50123.5","qty":"0.004","side":"buy","ts":1700000000123}"#;
        let event = parse_trade(text).unwrap().expect("a trade frame");
        assert_eq!(event.symbol, "BTCUSDT");
        assert!((event.price - 50123.5).abs() < 1e-9);
        assert!((event.qty - 0.004).abs() < 1e-12);
        assert_eq!(event.side, Side::Buy);
        assert_eq!(event.ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn accepts_numeric_price_and_qty() {
        let text = r#"{"channel":"trades","symbol":"ETHUSDT","price":2500.25,"qty":0.5,"side":"SELL","ts":1700000000000}"#;
        let event = parse_trade(text).unwrap().unwrap();
        assert!((event.price - 2500.25).abs() < 1e-9);
        assert_eq!(event.side, Side::Sell);
    }

    #[test]
    fn ignores_non_trade_frames() {
        let ack = r#"{"op":"subscribe","success":true}"#;
        assert!(parse_trade(ack).unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(parse_trade("not json").is_err());
        let missing = r#"{"channel":"trades","symbol":"BTCUSDT","qty":"1","side":"buy","ts":1}"#;
        assert!(parse_trade(missing).is_err());
        let bad_side = r#"{"channel":"trades","symbol":"BTCUSDT","price":"1","qty":"1","side":"hold","ts":1}"#;
        assert!(parse_trade(bad_side).is_err());
    }
}
