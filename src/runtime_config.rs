// =============================================================================
// Runtime Configuration — Hot-reloadable guardian settings with atomic save
// =============================================================================
//
// Central configuration hub for the Sentinel trade guardian.  Every tunable
// exit threshold lives here so the engine can be reconfigured without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
//
// Periodic jobs and tick evaluation always work on a **cloned snapshot** of
// this struct: reads stay consistent within one tick / job run even if the
// backing configuration is updated concurrently.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_reference_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_price_poll_secs() -> u64 {
    3
}

fn default_supervisor_interval_secs() -> u64 {
    60
}

fn default_advisor_interval_secs() -> u64 {
    300
}

fn default_reviewer_interval_secs() -> u64 {
    600
}

fn default_risk_monitor_interval_secs() -> u64 {
    900
}

fn default_scalp_target_pct() -> f64 {
    0.008
}

fn default_trailing_activation_pct() -> f64 {
    0.05
}

fn default_trailing_callback_pct() -> f64 {
    0.02
}

fn default_notify_increment_pct() -> f64 {
    0.01
}

fn default_max_close_retries() -> u32 {
    3
}

fn default_strong_trend_adx() -> f64 {
    30.0
}

fn default_reward_ratio() -> f64 {
    2.0
}

fn default_min_portfolio_value() -> f64 {
    100.0
}

fn default_min_asset_value() -> f64 {
    10.0
}

fn default_max_asset_pct() -> f64 {
    40.0
}

fn default_max_sector_pct() -> f64 {
    60.0
}

// =============================================================================
// GuardianConfig
// =============================================================================

/// Top-level runtime configuration for the Sentinel guardian.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    // --- Symbols --------------------------------------------------------------

    /// Symbols the guardian may hold positions in (lot-size filters are
    /// preloaded for these; the ledger drives the live watch set).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Quote asset every tracked symbol settles in (e.g. "USDT").
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Market-reference symbol used by the advisor's weakness check.
    #[serde(default = "default_reference_symbol")]
    pub reference_symbol: String,

    // --- Scheduling -----------------------------------------------------------

    /// Interval between price polls driving guardian ticks.
    #[serde(default = "default_price_poll_secs")]
    pub price_poll_secs: u64,

    /// Interval between supervisor passes over incubated trades.
    #[serde(default = "default_supervisor_interval_secs")]
    pub supervisor_interval_secs: u64,

    /// Interval between tactical-advisor passes over active trades.
    #[serde(default = "default_advisor_interval_secs")]
    pub advisor_interval_secs: u64,

    /// Interval between signal-reviewer passes over active trades.
    #[serde(default = "default_reviewer_interval_secs")]
    pub reviewer_interval_secs: u64,

    /// Interval between portfolio concentration checks.
    #[serde(default = "default_risk_monitor_interval_secs")]
    pub risk_monitor_interval_secs: u64,

    // --- Exit thresholds ------------------------------------------------------

    /// When set, a tighter scalp target replaces waiting for the full
    /// take-profit level.
    #[serde(default)]
    pub scalp_mode: bool,

    /// Scalp target as a fraction of entry price (0.008 = +0.8 %).
    #[serde(default = "default_scalp_target_pct")]
    pub scalp_target_pct: f64,

    /// Gain (fraction of entry) at which the trailing stop activates.
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: f64,

    /// Distance of the trailing stop below the highest seen price.
    #[serde(default = "default_trailing_callback_pct")]
    pub trailing_callback_pct: f64,

    /// Price gain (fraction of the last notified price) that triggers an
    /// incremental profit notification.
    #[serde(default = "default_notify_increment_pct")]
    pub notify_increment_pct: f64,

    // --- Hardened closure -----------------------------------------------------

    /// Outer attempts before a failed closure parks the trade as incubated.
    #[serde(default = "default_max_close_retries")]
    pub max_close_retries: u32,

    // --- Tactical advisor -----------------------------------------------------

    /// When true, a confirmed weakness check liquidates the trade; otherwise
    /// it only sends an advisory notification.
    #[serde(default)]
    pub auto_close_on_weakness: bool,

    /// ADX value above which the trend is considered strong enough to extend
    /// the take-profit target.
    #[serde(default = "default_strong_trend_adx")]
    pub strong_trend_adx: f64,

    /// Multiplier applied to ATR when computing an extended take-profit.
    #[serde(default = "default_reward_ratio")]
    pub reward_ratio: f64,

    // --- Portfolio risk monitor ----------------------------------------------

    /// Portfolios valued below this (in quote units) are skipped entirely.
    #[serde(default = "default_min_portfolio_value")]
    pub min_portfolio_value: f64,

    /// Assets valued below this are ignored by the concentration check.
    #[serde(default = "default_min_asset_value")]
    pub min_asset_value: f64,

    /// Per-asset concentration alert threshold (percent of portfolio).
    #[serde(default = "default_max_asset_pct")]
    pub max_asset_pct: f64,

    /// Per-sector aggregate concentration alert threshold (percent).
    #[serde(default = "default_max_sector_pct")]
    pub max_sector_pct: f64,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            quote_asset: default_quote_asset(),
            reference_symbol: default_reference_symbol(),
            price_poll_secs: default_price_poll_secs(),
            supervisor_interval_secs: default_supervisor_interval_secs(),
            advisor_interval_secs: default_advisor_interval_secs(),
            reviewer_interval_secs: default_reviewer_interval_secs(),
            risk_monitor_interval_secs: default_risk_monitor_interval_secs(),
            scalp_mode: false,
            scalp_target_pct: default_scalp_target_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trailing_callback_pct: default_trailing_callback_pct(),
            notify_increment_pct: default_notify_increment_pct(),
            max_close_retries: default_max_close_retries(),
            auto_close_on_weakness: false,
            strong_trend_adx: default_strong_trend_adx(),
            reward_ratio: default_reward_ratio(),
            min_portfolio_value: default_min_portfolio_value(),
            min_asset_value: default_min_asset_value(),
            max_asset_pct: default_max_asset_pct(),
            max_sector_pct: default_max_sector_pct(),
        }
    }
}

impl GuardianConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read guardian config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse guardian config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            scalp_mode = config.scalp_mode,
            "guardian config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise guardian config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "guardian config saved (atomic)");
        Ok(())
    }
}
