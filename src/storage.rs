// =============================================================================
// Storage Sink — optional append-only capture of features and prices
// =============================================================================
//
// Fire-and-forget: records go over a channel to a background JSONL writer for
// offline model training. Failures are logged, never fatal, and the engine
// runs identically with storage disabled.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::Side;

/// Feature vector capture at strategy-trigger time.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRecord {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub features: [f64; 3],
    pub vwap: f64,
    pub std: f64,
}

/// Raw trade capture.
#[derive(Debug, Clone, Serialize)]
pub struct PriceRecord {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
    pub side: Side,
}

/// Offline-training data sink.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store_features(&self, record: FeatureRecord);
    async fn store_price(&self, record: PriceRecord);
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredLine {
    Features(FeatureRecord),
    Price(PriceRecord),
}

/// JSONL-backed sink with a background writer.
pub struct JsonlStore {
    tx: mpsc::UnboundedSender<StoredLine>,
}

impl JsonlStore {
    pub fn open(path: impl Into<String>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<StoredLine>();

        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;

            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path, error = %e, "storage unavailable — records will be dropped");
                    while rx.recv().await.is_some() {}
                    return;
                }
            };

            info!(path = %path, "storage writer started");

            while let Some(line) = rx.recv().await {
                let mut serialised = match serde_json::to_string(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "storage record serialisation failed");
                        continue;
                    }
                };
                serialised.push('\n');
                if let Err(e) = file.write_all(serialised.as_bytes()).await {
                    warn!(error = %e, "storage write failed");
                }
            }

            let _ = file.flush().await;
            info!("storage writer stopped");
        });

        Self { tx }
    }
}

#[async_trait]
impl StorageSink for JsonlStore {
    async fn store_features(&self, record: FeatureRecord) {
        let _ = self.tx.send(StoredLine::Features(record));
    }

    async fn store_price(&self, record: PriceRecord) {
        let _ = self.tx.send(StoredLine::Price(record));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn records_land_as_tagged_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.jsonl");
        let store = JsonlStore::open(path.to_str().unwrap());

        store
            .store_features(FeatureRecord {
                symbol: "BTCUSDT".into(),
                ts: Utc::now(),
                features: [0.1, -0.2, 1.5],
                vwap: 50_000.0,
                std: 120.0,
            })
            .await;
        store
            .store_price(PriceRecord {
                symbol: "BTCUSDT".into(),
                ts: Utc::now(),
                price: 50_100.0,
                volume: 0.25,
                side: Side::Sell,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "features");
        assert_eq!(lines[0]["vwap"], 50_000.0);
        assert_eq!(lines[1]["kind"], "price");
        assert_eq!(lines[1]["side"], "SELL");
    }
}
