// =============================================================================
// Audit Log — append-only JSONL trail of every order placement attempt
// =============================================================================
//
// Records flow over an unbounded channel to a background writer so the hot
// path never blocks on disk. A write failure is logged and dropped — the
// audit trail degrades, trading does not.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{Side, TradeSide};

/// One order placement attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub trade_side: TradeSide,
    pub qty: String,
    pub price: f64,
    pub balance: f64,
    pub daily_pnl: f64,
    pub client_order_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle to the background audit writer. Cloneable; dropping every clone
/// closes the channel and lets the writer drain and exit.
#[derive(Clone)]
pub struct AuditLog {
    tx: Option<mpsc::UnboundedSender<AuditRecord>>,
}

impl AuditLog {
    /// Open (append) the audit file and spawn the writer task.
    pub fn open(path: impl Into<String>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();

        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;

            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path, error = %e, "audit log unavailable — records will be dropped");
                    // Drain the channel so senders never block or error.
                    while rx.recv().await.is_some() {}
                    return;
                }
            };

            info!(path = %path, "audit log writer started");

            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_string(&record) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "audit record serialisation failed");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "audit write failed");
                }
            }

            let _ = file.flush().await;
            info!("audit log writer stopped");
        });

        Self { tx: Some(tx) }
    }

    /// No-op audit log for tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Fire-and-forget record submission.
    pub fn record(&self, record: AuditRecord) {
        if let Some(tx) = &self.tx {
            // A closed channel only happens during shutdown; dropping the
            // record there is fine.
            let _ = tx.send(record);
        }
    }
}
