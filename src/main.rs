// =============================================================================
// Meridian Perp Engine — Main Entry Point
// =============================================================================
//
// The engine starts on the paper client unless dry_run is off AND the
// MERIDIAN_ENABLE_LIVE=1 environment flag is set. A config file alone can
// never send live orders.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod audit;
mod breaker;
mod config;
mod executor;
mod features;
mod market_data;
mod metrics;
mod ml;
mod orders;
mod risk;
mod storage;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditLog;
use crate::breaker::CircuitBreaker;
use crate::config::{Config, MlRuntimeKind};
use crate::executor::Executor;
use crate::features::FeatureHub;
use crate::metrics::{MetricsSink, PrometheusSink};
use crate::ml::{ExternalRuntime, FeatureRanges, MlGate, ModelRuntime, NativeRuntime};
use crate::orders::{OrderClient, OrderRouter, OrderTracker, PaperClient, RestClient};
use crate::risk::{RiskFirewall, RiskLimits};
use crate::storage::{JsonlStore, StorageSink};
use crate::strategy::{MeanReversion, OvirX};

/// Rolling window for the error ratio fed to the circuit breaker.
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Reconnect backoff bounds for the market-data streams.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian Perp Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian.json".to_string());
    let mut config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    // Credentials come from the environment, never from the config file.
    if let Ok(key) = std::env::var("MERIDIAN_API_KEY") {
        config.credentials.api_key = key;
    }
    if let Ok(secret) = std::env::var("MERIDIAN_API_SECRET") {
        config.credentials.api_secret = secret;
    }
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.trading.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Validation failures are fatal: refuse to start.
    config.validate()?;
    let config = Arc::new(config);

    let live = config.live_trading_enabled();
    info!(
        symbols = ?config.trading.symbols,
        dry_run = config.trading.dry_run,
        live,
        "configured trading pairs"
    );

    // ── 2. Metrics ───────────────────────────────────────────────────────
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusSink::new(ERROR_RATE_WINDOW));

    // ── 3. Sinks ─────────────────────────────────────────────────────────
    let audit = AuditLog::open(config.audit_path.clone());
    let storage: Option<Arc<dyn StorageSink>> = config
        .storage_path
        .as_ref()
        .map(|p| Arc::new(JsonlStore::open(p.clone())) as Arc<dyn StorageSink>);

    // ── 4. Core components ───────────────────────────────────────────────
    let features = Arc::new(FeatureHub::new(&config.trading.symbols, &config.features));

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        config.circuit_breaker.clone(),
        metrics.clone(),
    ));

    let exposure_overrides = config
        .symbol_overrides
        .iter()
        .filter_map(|(s, o)| o.max_position_exposure.map(|e| (s.clone(), e)))
        .collect();
    let firewall = Arc::new(RiskFirewall::new(
        config.trading.initial_balance,
        RiskLimits {
            max_daily_loss: config.trading.max_daily_loss,
            max_drawdown: config.trading.max_drawdown_protection,
            max_exposure: config.trading.max_position_exposure,
            exposure_overrides,
        },
        circuit_breaker.clone(),
        metrics.clone(),
    ));

    // ── 5. ML gate ───────────────────────────────────────────────────────
    let runtime: Option<Arc<dyn ModelRuntime>> = match (config.ml.runtime, &config.ml.model_path) {
        (MlRuntimeKind::Native, Some(path)) => match NativeRuntime::load(path) {
            Ok(rt) => Some(Arc::new(rt)),
            Err(e) => {
                // Malformed model: permanent degradation to the fallback.
                error!(error = %e, path, "native model unavailable — fallback heuristic only");
                None
            }
        },
        (MlRuntimeKind::External, Some(command)) => {
            match ExternalRuntime::spawn(command, crate::features::FEATURE_DIMENSION) {
                Ok(rt) => Some(Arc::new(rt)),
                Err(e) => {
                    error!(error = %e, command, "model process unavailable — fallback heuristic only");
                    None
                }
            }
        }
        _ => None,
    };
    let gate = Arc::new(MlGate::new(
        &config.ml,
        FeatureRanges::with_max_distance(config.trading.max_price_distance),
        runtime,
        metrics.clone(),
    ));

    // ── 6. Order path ────────────────────────────────────────────────────
    let client: Arc<dyn OrderClient> = if live {
        warn!("LIVE TRADING ENABLED — orders will reach the exchange");
        Arc::new(RestClient::new(
            config.credentials.api_key.clone(),
            config.credentials.api_secret.clone(),
            config.credentials.base_url.clone(),
            config.orders.rest_timeout(),
        ))
    } else {
        info!("paper trading — orders are simulated in-process");
        Arc::new(PaperClient::new())
    };
    let router = Arc::new(OrderRouter::new(client, config.orders.rest_timeout()));
    let tracker = Arc::new(OrderTracker::new(
        router.clone(),
        config.orders.clone(),
        metrics.clone(),
    ));

    // ── 7. Executor & strategies ─────────────────────────────────────────
    let executor = Arc::new(Executor::new(
        config.clone(),
        features.clone(),
        firewall,
        circuit_breaker,
        router,
        tracker.clone(),
        metrics,
        audit,
        storage,
    ));
    executor.register_strategy(Arc::new(OvirX::new(
        gate.clone(),
        config.ml.prob_threshold,
        config.trading.max_price_distance,
    )));
    executor.register_strategy(Arc::new(MeanReversion));

    // ── 8. Shutdown channel ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 9. Market data streams (reconnect with exponential backoff) ─────
    for symbol in &config.trading.symbols {
        let ws_url = config.credentials.ws_url.clone();
        let sym = symbol.clone();
        let exec = executor.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            loop {
                match market_data::run_trade_stream(&ws_url, &sym, &exec, &mut rx).await {
                    Ok(()) => return, // clean end = shutdown
                    Err(e) => {
                        error!(symbol = %sym, error = %e, backoff_s = backoff.as_secs(), "trade stream error — reconnecting");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = rx.changed() => return,
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        });

        let ws_url = config.credentials.ws_url.clone();
        let sym = symbol.clone();
        let exec = executor.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            loop {
                match market_data::run_depth_stream(&ws_url, &sym, &exec, &mut rx).await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(symbol = %sym, error = %e, backoff_s = backoff.as_secs(), "depth stream error — reconnecting");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = rx.changed() => return,
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        });
    }
    info!(count = config.trading.symbols.len(), "market data streams launched");

    // ── 10. Background loops ─────────────────────────────────────────────
    let tracker_handle = tokio::spawn(tracker.clone().run(shutdown_rx.clone()));
    ml::spawn_cache_cleaner(gate.clone(), shutdown_rx.clone());

    // Feed-stall watchdog: prolonged silence triggers the shutdown alarm.
    {
        let features = features.clone();
        let stall = config.stall_threshold();
        let tx = shutdown_tx.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if features.idle_for() > stall {
                            error!(
                                idle_s = features.idle_for().as_secs(),
                                "market data stalled beyond threshold — shutting down"
                            );
                            let _ = tx.send(true);
                            return;
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        });
    }

    // ── 11. API server ───────────────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        executor: executor.clone(),
        gate,
        tracker,
        prometheus,
    });
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    tokio::spawn(async move {
        let app = api::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    let mut shutdown_watch = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
        _ = shutdown_watch.changed() => {
            warn!("internal shutdown alarm — stopping gracefully");
        }
    }

    // Stop new ticks first, then stop the workers (the tracker cancels its
    // outstanding deadlined orders on the way out).
    executor.stop_accepting();
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(10), tracker_handle).await;

    info!("Meridian Perp Engine shut down complete.");
    Ok(())
}
