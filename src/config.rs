// =============================================================================
// Configuration — engine settings with atomic save and startup validation
// =============================================================================
//
// Every tunable parameter of the engine lives here. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash, and all fields carry
// `#[serde(default)]` so adding new fields never breaks loading an older file.
//
// Validation is fatal: a config that fails `validate()` refuses to start the
// engine. Live order flow additionally requires `dry_run = false` AND the
// MERIDIAN_ENABLE_LIVE=1 environment flag — a config file alone can never
// switch the engine to live trading.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Environment flag that must be set to "1" before live orders are sent.
pub const LIVE_TRADING_ENV: &str = "MERIDIAN_ENABLE_LIVE";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_base_url() -> String {
    "https://api.exchange.invalid".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.exchange.invalid/ws".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_base_size_ratio() -> f64 {
    0.02
}

fn default_max_position_size() -> f64 {
    5.0
}

fn default_max_position_exposure() -> f64 {
    0.10
}

fn default_max_daily_loss() -> f64 {
    0.02
}

fn default_max_drawdown() -> f64 {
    0.15
}

fn default_max_price_distance() -> f64 {
    5.0
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_risk_usd() -> f64 {
    100.0
}

fn default_leverage() -> f64 {
    1.0
}

fn default_qty_step() -> f64 {
    0.001
}

fn default_strategy_trigger_trades() -> u64 {
    1
}

fn default_kelly_win_rate() -> f64 {
    0.5
}

fn default_kelly_ratio_side() -> f64 {
    1.0
}

fn default_vwap_window_secs() -> u64 {
    30
}

fn default_vwap_size() -> usize {
    600
}

fn default_tick_size() -> usize {
    100
}

fn default_prob_threshold() -> f64 {
    0.65
}

fn default_ml_timeout_ms() -> u64 {
    50
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_concurrent_preds() -> usize {
    8
}

fn default_breaker_volatility() -> f64 {
    0.05
}

fn default_breaker_imbalance() -> f64 {
    0.8
}

fn default_breaker_volume() -> f64 {
    10.0
}

fn default_breaker_error_rate() -> f64 {
    0.3
}

fn default_recovery_time_ms() -> u64 {
    60_000
}

fn default_rest_timeout_ms() -> u64 {
    5_000
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_status_check_interval_ms() -> i64 {
    1_000
}

fn default_max_order_retries() -> u32 {
    3
}

fn default_stall_threshold_secs() -> u64 {
    120
}

fn default_audit_path() -> String {
    "meridian_audit.jsonl".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Exchange credentials and endpoints. The secret never appears in logs; see
/// the manual `Debug` impl below.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_base_url(),
            ws_url: default_ws_url(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .finish()
    }
}

/// Kelly-sizing inputs. The original engine hard-coded these; here they are
/// configuration so a statistics feed can overwrite them at runtime. The
/// defaults are deliberately break-even (Kelly fraction 0) so that sizing is
/// inert until an operator supplies real numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyInputs {
    #[serde(default = "default_kelly_win_rate")]
    pub win_rate: f64,
    #[serde(default = "default_kelly_ratio_side")]
    pub avg_win: f64,
    #[serde(default = "default_kelly_ratio_side")]
    pub avg_loss: f64,
}

impl Default for KellyInputs {
    fn default() -> Self {
        Self {
            win_rate: default_kelly_win_rate(),
            avg_win: default_kelly_ratio_side(),
            avg_loss: default_kelly_ratio_side(),
        }
    }
}

/// Trading limits and sizing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Base position size as a fraction of balance used by sizing heuristics.
    #[serde(default = "default_base_size_ratio")]
    pub base_size_ratio: f64,

    /// Hard multiplier cap on position quantity (`max_position_size *
    /// risk_usd / price`).
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Maximum notional exposure per symbol as a fraction of initial balance.
    #[serde(default = "default_max_position_exposure")]
    pub max_position_exposure: f64,

    /// Maximum daily loss as a fraction of initial balance (0.02 = 2 %).
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Maximum drawdown from peak balance before trading suspends.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_protection: f64,

    /// Maximum |price distance| (z-score) a strategy will act on; also the
    /// ML-gate validation bound for that feature.
    #[serde(default = "default_max_price_distance")]
    pub max_price_distance: f64,

    /// When true, orders are routed to the in-memory paper client.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    /// Dollar amount at risk per trade before Kelly scaling.
    #[serde(default = "default_risk_usd")]
    pub risk_usd: f64,

    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Quantity step the exchange accepts; computed sizes are floored to it.
    #[serde(default = "default_qty_step")]
    pub qty_step: f64,

    /// Run the strategy fan-out every N accepted trades per symbol.
    #[serde(default = "default_strategy_trigger_trades")]
    pub strategy_trigger_trades: u64,

    #[serde(default)]
    pub kelly: KellyInputs,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            base_size_ratio: default_base_size_ratio(),
            max_position_size: default_max_position_size(),
            max_position_exposure: default_max_position_exposure(),
            max_daily_loss: default_max_daily_loss(),
            max_drawdown_protection: default_max_drawdown(),
            max_price_distance: default_max_price_distance(),
            dry_run: true,
            initial_balance: default_initial_balance(),
            risk_usd: default_risk_usd(),
            leverage: default_leverage(),
            qty_step: default_qty_step(),
            strategy_trigger_trades: default_strategy_trigger_trades(),
            kelly: KellyInputs::default(),
        }
    }
}

/// Per-symbol overrides. Any `None` falls back to the global value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolOverride {
    #[serde(default)]
    pub base_size_ratio: Option<f64>,
    #[serde(default)]
    pub max_position_size: Option<f64>,
    #[serde(default)]
    pub max_position_exposure: Option<f64>,
    #[serde(default)]
    pub max_price_distance: Option<f64>,
    #[serde(default)]
    pub qty_step: Option<f64>,
}

/// Feature-engine windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// VWAP rolling window duration in seconds.
    #[serde(default = "default_vwap_window_secs")]
    pub vwap_window_secs: u64,

    /// VWAP ring capacity (samples). Preallocated once per symbol.
    #[serde(default = "default_vwap_size")]
    pub vwap_size: usize,

    /// Number of recent trades in the tick-imbalance window.
    #[serde(default = "default_tick_size")]
    pub tick_size: usize,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            vwap_window_secs: default_vwap_window_secs(),
            vwap_size: default_vwap_size(),
            tick_size: default_tick_size(),
        }
    }
}

/// Which inference runtime backs the ML gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlRuntimeKind {
    /// In-process scorer loaded from the JSON weight artifact at `model_path`.
    Native,
    /// Child process speaking line-delimited JSON; `model_path` is the
    /// command to spawn.
    External,
    /// No model — the deterministic fallback heuristic decides everything.
    Fallback,
}

impl Default for MlRuntimeKind {
    fn default() -> Self {
        Self::Fallback
    }
}

/// ML gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    #[serde(default)]
    pub runtime: MlRuntimeKind,

    /// Weight artifact (native) or command line (external).
    #[serde(default)]
    pub model_path: Option<String>,

    /// Probability threshold for approval.
    #[serde(default = "default_prob_threshold")]
    pub prob_threshold: f64,

    /// Per-inference deadline in milliseconds.
    #[serde(default = "default_ml_timeout_ms")]
    pub timeout_ms: u64,

    /// Minimum p1 the fallback heuristic treats as confident enough to log
    /// as a model-quality concern when the model disagrees with it.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_max_concurrent_preds")]
    pub max_concurrent_preds: usize,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            runtime: MlRuntimeKind::Fallback,
            model_path: None,
            prob_threshold: default_prob_threshold(),
            timeout_ms: default_ml_timeout_ms(),
            min_confidence: default_min_confidence(),
            cache_size: default_cache_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_concurrent_preds: default_max_concurrent_preds(),
        }
    }
}

impl MlConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Circuit-breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Relative volatility (window std / vwap) above which the latch trips.
    #[serde(default = "default_breaker_volatility")]
    pub volatility: f64,

    /// |depth imbalance| above which the latch trips.
    #[serde(default = "default_breaker_imbalance")]
    pub imbalance: f64,

    /// Volume-spike ratio (trade volume / window mean) above which the latch
    /// trips.
    #[serde(default = "default_breaker_volume")]
    pub volume: f64,

    /// Windowed error ratio above which the latch trips.
    #[serde(default = "default_breaker_error_rate")]
    pub error_rate: f64,

    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volatility: default_breaker_volatility(),
            imbalance: default_breaker_imbalance(),
            volume: default_breaker_volume(),
            error_rate: default_breaker_error_rate(),
            recovery_time_ms: default_recovery_time_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }
}

/// Order execution timeouts and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExecConfig {
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,

    /// How long an order may stay pending before cancel-on-timeout.
    #[serde(default = "default_execution_timeout_ms")]
    pub order_execution_timeout_ms: u64,

    /// Sweeper tick. Signed on purpose: a non-positive value from an old
    /// config file is replaced by a safe default instead of spinning.
    #[serde(default = "default_status_check_interval_ms")]
    pub order_status_check_interval_ms: i64,

    #[serde(default = "default_max_order_retries")]
    pub max_order_retries: u32,
}

impl Default for OrderExecConfig {
    fn default() -> Self {
        Self {
            rest_timeout_ms: default_rest_timeout_ms(),
            order_execution_timeout_ms: default_execution_timeout_ms(),
            order_status_check_interval_ms: default_status_check_interval_ms(),
            max_order_retries: default_max_order_retries(),
        }
    }
}

impl OrderExecConfig {
    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.order_execution_timeout_ms)
    }

    /// Sweeper interval with the safety floor applied.
    pub fn status_check_interval(&self) -> Duration {
        if self.order_status_check_interval_ms <= 0 {
            warn!(
                configured = self.order_status_check_interval_ms,
                "order_status_check_interval_ms is non-positive — using 1000ms"
            );
            return Duration::from_millis(default_status_check_interval_ms() as u64);
        }
        Duration::from_millis(self.order_status_check_interval_ms as u64)
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub trading: TradingConfig,

    /// Per-symbol overrides keyed by symbol.
    #[serde(default)]
    pub symbol_overrides: HashMap<String, SymbolOverride>,

    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub ml: MlConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub orders: OrderExecConfig,

    /// Data-feed stall threshold; exceeding it triggers the shutdown alarm.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,

    /// Append-only audit trail of order placement attempts.
    #[serde(default = "default_audit_path")]
    pub audit_path: String,

    /// Optional append-only store for offline training data. Disabled when
    /// absent.
    #[serde(default)]
    pub storage_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            trading: TradingConfig::default(),
            symbol_overrides: HashMap::new(),
            features: FeaturesConfig::default(),
            ml: MlConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            orders: OrderExecConfig::default(),
            stall_threshold_secs: default_stall_threshold_secs(),
            audit_path: default_audit_path(),
            storage_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.trading.symbols,
            dry_run = config.trading.dry_run,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Validate the configuration. Errors here are fatal: the engine refuses
    /// to start rather than run with nonsensical limits.
    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;

        if t.symbols.is_empty() {
            anyhow::bail!("trading.symbols must not be empty");
        }
        if t.initial_balance <= 0.0 || !t.initial_balance.is_finite() {
            anyhow::bail!("trading.initial_balance must be a positive finite number");
        }
        if !(0.0..1.0).contains(&t.max_daily_loss) || t.max_daily_loss == 0.0 {
            anyhow::bail!("trading.max_daily_loss must be in (0, 1)");
        }
        if !(0.0..1.0).contains(&t.max_drawdown_protection) || t.max_drawdown_protection == 0.0 {
            anyhow::bail!("trading.max_drawdown_protection must be in (0, 1)");
        }
        if t.max_position_exposure <= 0.0 {
            anyhow::bail!("trading.max_position_exposure must be positive");
        }
        if t.risk_usd <= 0.0 || t.leverage < 1.0 {
            anyhow::bail!("trading.risk_usd must be positive and leverage >= 1");
        }
        if t.qty_step <= 0.0 {
            anyhow::bail!("trading.qty_step must be positive");
        }
        if !(0.0..=1.0).contains(&t.kelly.win_rate) || t.kelly.avg_loss <= 0.0 {
            anyhow::bail!("trading.kelly inputs out of range");
        }

        if self.features.vwap_size == 0 || self.features.tick_size == 0 {
            anyhow::bail!("features.vwap_size and features.tick_size must be positive");
        }
        if self.features.vwap_window_secs == 0 {
            anyhow::bail!("features.vwap_window_secs must be positive");
        }

        if !(0.0..=1.0).contains(&self.ml.prob_threshold) {
            anyhow::bail!("ml.prob_threshold must be in [0, 1]");
        }
        if self.ml.cache_size == 0 || self.ml.max_concurrent_preds == 0 {
            anyhow::bail!("ml.cache_size and ml.max_concurrent_preds must be positive");
        }
        if self.ml.runtime != MlRuntimeKind::Fallback && self.ml.model_path.is_none() {
            anyhow::bail!("ml.model_path is required for the {:?} runtime", self.ml.runtime);
        }

        if self.circuit_breaker.recovery_time_ms == 0 {
            anyhow::bail!("circuit_breaker.recovery_time_ms must be positive");
        }

        Ok(())
    }

    /// Live orders go out only when dry_run is off AND the operator set the
    /// explicit environment flag. Everything else runs on the paper client.
    pub fn live_trading_enabled(&self) -> bool {
        if self.trading.dry_run {
            return false;
        }
        match std::env::var(LIVE_TRADING_ENV) {
            Ok(v) if v == "1" => true,
            _ => {
                warn!(
                    "dry_run is false but {} is not set to 1 — staying on the paper client",
                    LIVE_TRADING_ENV
                );
                false
            }
        }
    }

    // ── Per-symbol lookups ───────────────────────────────────────────────

    pub fn max_exposure(&self, symbol: &str) -> f64 {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.max_position_exposure)
            .unwrap_or(self.trading.max_position_exposure)
    }

    pub fn max_position_size(&self, symbol: &str) -> f64 {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.max_position_size)
            .unwrap_or(self.trading.max_position_size)
    }

    pub fn max_price_distance(&self, symbol: &str) -> f64 {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.max_price_distance)
            .unwrap_or(self.trading.max_price_distance)
    }

    pub fn qty_step(&self, symbol: &str) -> f64 {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.qty_step)
            .unwrap_or(self.trading.qty_step)
    }

    pub fn vwap_window(&self) -> Duration {
        Duration::from_secs(self.features.vwap_window_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = Config::default();
        cfg.validate().expect("default config must be valid");
        assert!(cfg.trading.dry_run, "default config must be dry-run");
        assert_eq!(cfg.trading.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!((cfg.trading.max_daily_loss - 0.02).abs() < f64::EPSILON);
        assert!((cfg.ml.prob_threshold - 0.65).abs() < f64::EPSILON);
        assert_eq!(cfg.stall_threshold_secs, 120);
        assert_eq!(cfg.audit_path, "meridian_audit.jsonl");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.features.vwap_size, 600);
        assert_eq!(cfg.features.tick_size, 100);
        assert_eq!(cfg.ml.runtime, MlRuntimeKind::Fallback);
        assert_eq!(cfg.orders.max_order_retries, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading": { "symbols": ["SOLUSDT"], "max_daily_loss": 0.05 } }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading.symbols, vec!["SOLUSDT"]);
        assert!((cfg.trading.max_daily_loss - 0.05).abs() < f64::EPSILON);
        assert!((cfg.trading.max_drawdown_protection - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn per_symbol_override_beats_global() {
        let json = r#"{
            "symbol_overrides": {
                "BTCUSDT": { "max_position_exposure": 0.25, "qty_step": 0.0001 }
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!((cfg.max_exposure("BTCUSDT") - 0.25).abs() < f64::EPSILON);
        assert!((cfg.max_exposure("ETHUSDT") - 0.10).abs() < f64::EPSILON);
        assert!((cfg.qty_step("BTCUSDT") - 0.0001).abs() < f64::EPSILON);
        assert!((cfg.qty_step("ETHUSDT") - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn validation_rejects_bad_limits() {
        let mut cfg = Config::default();
        cfg.trading.max_daily_loss = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.trading.initial_balance = -5.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.trading.symbols.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.ml.runtime = MlRuntimeKind::Native;
        cfg.ml.model_path = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_sweep_interval_gets_safe_floor() {
        let mut orders = OrderExecConfig::default();
        orders.order_status_check_interval_ms = 0;
        assert_eq!(orders.status_check_interval(), Duration::from_millis(1000));

        orders.order_status_check_interval_ms = -50;
        assert_eq!(orders.status_check_interval(), Duration::from_millis(1000));

        orders.order_status_check_interval_ms = 250;
        assert_eq!(orders.status_check_interval(), Duration::from_millis(250));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = Config::default();
        cfg.trading.symbols = vec!["BTCUSDT".into()];
        cfg.trading.risk_usd = 250.0;
        cfg.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.trading.symbols, vec!["BTCUSDT"]);
        assert!((reloaded.trading.risk_usd - 250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_gate_requires_env_flag() {
        let mut cfg = Config::default();
        cfg.trading.dry_run = true;
        assert!(!cfg.live_trading_enabled());

        // dry_run off but without the env flag the gate still refuses.
        cfg.trading.dry_run = false;
        std::env::remove_var(LIVE_TRADING_ENV);
        assert!(!cfg.live_trading_enabled());
    }
}
