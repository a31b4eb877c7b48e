// =============================================================================
// Signal Reviewer — does the entry thesis still hold?
// =============================================================================
//
// Every trade records the strategy that opened it in `entry_reason`.  The
// reviewer periodically re-runs that strategy's validity check against fresh
// candles; a negative verdict closes the trade with the `Reviewer` reason.
//
// Strategies register as `SignalCheck` implementations in the shared
// `SignalRegistry`.  The trait is async so remote-capable checks and plain
// indicator math get a uniform invocation path; the built-ins never suspend.
// Trades whose strategy has no registered check are skipped, never closed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::guardian::closure;
use crate::indicators::{ma, rsi};
use crate::ledger::{CloseReason, TradeStatus};
use crate::runtime_config::GuardianConfig;
use crate::types::Candle;

/// Candle interval and depth used for re-evaluation.
const REVIEW_INTERVAL: &str = "1h";
const REVIEW_KLINE_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Capability + registry
// ---------------------------------------------------------------------------

/// Re-evaluation of an entry signal against fresh market data.
///
/// `Ok(true)` means the signal still validates; `Ok(false)` invalidates the
/// trade.  Errors mean "could not judge" and leave the trade untouched.
#[async_trait]
pub trait SignalCheck: Send + Sync {
    async fn evaluate(
        &self,
        symbol: &str,
        candles: &[Candle],
        config: &GuardianConfig,
    ) -> Result<bool>;
}

/// Named lookup of registered signal checks.
pub struct SignalRegistry {
    checks: RwLock<HashMap<String, Arc<dyn SignalCheck>>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, check: Arc<dyn SignalCheck>) {
        info!(strategy = name, "signal check registered");
        self.checks.write().insert(name.to_string(), check);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn SignalCheck>> {
        self.checks.read().get(name).cloned()
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in checks
// ---------------------------------------------------------------------------

/// Valid while the EMA 9/21/55 stack stays bullishly aligned.
pub struct EmaTrendCheck;

#[async_trait]
impl SignalCheck for EmaTrendCheck {
    async fn evaluate(
        &self,
        _symbol: &str,
        candles: &[Candle],
        _config: &GuardianConfig,
    ) -> Result<bool> {
        let closes = Candle::closes(candles);
        Ok(matches!(ma::ema_trend_aligned(&closes), Some((true, _))))
    }
}

/// RSI band the momentum is considered healthy in (long positions).
const RSI_PERIOD: usize = 14;
const RSI_FLOOR: f64 = 45.0;
const RSI_CEILING: f64 = 80.0;

/// Valid while RSI stays inside the healthy band — neither momentum lost
/// (below the floor) nor blow-off territory (above the ceiling).
pub struct RsiHealthCheck;

#[async_trait]
impl SignalCheck for RsiHealthCheck {
    async fn evaluate(
        &self,
        _symbol: &str,
        candles: &[Candle],
        _config: &GuardianConfig,
    ) -> Result<bool> {
        let closes = Candle::closes(candles);
        match rsi::current_rsi(&closes, RSI_PERIOD) {
            Some(value) => Ok((RSI_FLOOR..=RSI_CEILING).contains(&value)),
            // Not enough data to judge — keep the trade.
            None => Ok(true),
        }
    }
}

/// Register the built-in checks under their strategy ids.
pub fn register_builtin_checks(registry: &SignalRegistry) {
    registry.register("ema_trend", Arc::new(EmaTrendCheck));
    registry.register("rsi_health", Arc::new(RsiHealthCheck));
}

// ---------------------------------------------------------------------------
// Review pass
// ---------------------------------------------------------------------------

/// Periodic reviewer loop.
pub async fn run_reviewer(state: Arc<AppState>) {
    let period = state.config_snapshot().reviewer_interval_secs;
    let mut ticker = interval(Duration::from_secs(period.max(1)));
    ticker.tick().await; // immediate first tick is skipped

    loop {
        ticker.tick().await;
        review_cycle(&state).await;
    }
}

/// One reviewer pass over all active trades.  Per-trade failures are logged
/// and isolated.
pub async fn review_cycle(state: &Arc<AppState>) {
    let trades = state.ledger.with_status(&TradeStatus::Active);
    if trades.is_empty() {
        return;
    }

    debug!(count = trades.len(), "reviewer pass started");

    for trade in trades {
        if let Err(e) = review_trade(state, &trade.id).await {
            warn!(id = %trade.id, symbol = %trade.symbol, error = %e, "review failed");
        }
    }
}

/// Re-evaluate one trade's entry signal; close it on a negative verdict.
pub async fn review_trade(state: &Arc<AppState>, trade_id: &str) -> Result<()> {
    let Some(trade) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if trade.status != TradeStatus::Active {
        return Ok(());
    }

    let strategy = trade.primary_strategy().to_string();
    let Some(check) = state.signal_registry.lookup(&strategy) else {
        debug!(id = trade_id, strategy, "no check registered — skipping review");
        return Ok(());
    };

    let candles = state
        .exchange
        .fetch_klines(&trade.symbol, REVIEW_INTERVAL, REVIEW_KLINE_LIMIT)
        .await?;

    let config = state.config_snapshot();
    let still_valid = check.evaluate(&trade.symbol, &candles, &config).await?;

    if still_valid {
        debug!(id = trade_id, strategy, "signal still valid");
        return Ok(());
    }

    info!(
        id = trade_id,
        symbol = %trade.symbol,
        strategy,
        "entry signal no longer validates — closing"
    );

    let _guard = state.lock_symbol(&trade.symbol).await;
    closure::execute(state, trade_id, CloseReason::Reviewer(strategy)).await
}
