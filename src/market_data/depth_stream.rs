// =============================================================================
// Depth stream — per-symbol aggregated book volume consumer
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
use crate::types::DepthEvent;

/// Consume the depth stream for `symbol` until disconnect or shutdown.
pub async fn run_depth_stream(
    ws_url: &str,
    symbol: &str,
    executor: &Arc<Executor>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!(url = %ws_url, symbol, "connecting to depth stream");

    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to depth WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "channel": "depth",
        "symbol": symbol,
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to subscribe to depth channel")?;

    info!(symbol, "depth stream connected");

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_depth(&text) {
                        Ok(Some(event)) => executor.on_depth(event),
                        Ok(None) => {}
                        Err(e) => warn!(symbol, error = %e, "failed to parse depth message"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(symbol, error = %e, "depth stream read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, "depth stream ended");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => {
                debug!(symbol, "depth stream stopping on shutdown");
                return Ok(());
            }
        }
    }
}

/// Parse one depth frame.
///
/// Expected shape:
/// ```json
/// { "channel": "depth", "symbol": "BTCUSDT", "bidVol": "12.5",
///   "askVol": "9.25", "ts": 1700000000123 }
/// ```
fn parse_depth(text: &str) -> Result<Option<DepthEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    if root.get("channel").and_then(|v| v.as_str()) != Some("depth") {
        return Ok(None);
    }

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_string();

    let bid_volume = parse_number(&root["bidVol"]).context("missing or malformed field bidVol")?;
    let ask_volume = parse_number(&root["askVol"]).context("missing or malformed field askVol")?;

    let ts_ms = root["ts"].as_i64().context("missing field ts")?;
    let ts = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .context("timestamp out of range")?;

    Ok(Some(DepthEvent {
        symbol,
        bid_volume,
        ask_volume,
        ts,
    }))
}

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
    fn parses_a_depth_frame() {
        let text = r#"{"channel":"depth","symbol":"BTCUSDT","bidVol":"12.5","askVol":"9.25","ts":1700000000123}"#;
        let event = parse_depth(text).unwrap().expect("a depth frame");
        assert_eq!(event.symbol, "BTCUSDT");
        assert!((event.bid_volume - 12.5).abs() < 1e-9);
        assert!((event.ask_volume - 9.25).abs() < 1e-9);
    }

    #[test]
    fn ignores_other_channels() {
        let text = r#"{"channel":"trades","symbol":"BTCUSDT","price":"1","qty":"1","side":"buy","ts":1}"#;
        assert!(parse_depth(text).unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_frames() {
        let missing = r#"{"channel":"depth","symbol":"BTCUSDT","askVol":"1","ts":1}"#;
        assert!(parse_depth(missing).is_err());
    }
}
