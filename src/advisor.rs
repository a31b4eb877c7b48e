// =============================================================================
// Tactical Advisor — mid-flight adjustments to active trades
// =============================================================================
//
// Two independent periodic operations per active trade:
//
//   weakness check      price below both the fast and slow moving average AND
//                       the market-reference symbol's momentum (ROC) negative
//                       -> liquidate (ForceExit) when auto_close_on_weakness,
//                       otherwise an advisory notification — never both
//
//   momentum extension  ADX above the strong-trend threshold -> raise the
//                       take-profit to price + ATR * reward_ratio, applied
//                       only when it beats the current target (monotonic)
//
// Both degrade to a logged no-op on any remote failure: the advisor improves
// outcomes when data is available and disappears when it is not.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::guardian::closure;
use crate::indicators::{adx, atr, ma, roc};
use crate::ledger::{CloseReason, TradeStatus};
use crate::types::Candle;

/// Candle interval and depth used for advisor analysis.
const ANALYSIS_INTERVAL: &str = "1h";
const ANALYSIS_KLINE_LIMIT: u32 = 100;

/// Moving-average windows of the weakness check.
const FAST_MA_PERIOD: usize = 7;
const SLOW_MA_PERIOD: usize = 25;

/// Momentum look-back of the market-reference ROC.
const REFERENCE_ROC_PERIOD: usize = 14;

/// Look-backs of the extension pipeline.
const ADX_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;

/// Delay between consecutive trades in one pass.
const INTER_TRADE_DELAY_SECS: u64 = 1;

/// Periodic advisor loop.
pub async fn run_advisor(state: Arc<AppState>) {
    let period = state.config_snapshot().advisor_interval_secs;
    let mut ticker = interval(Duration::from_secs(period.max(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        advise_cycle(&state).await;
    }
}

/// One pass over every active trade, running both checks.  Failures are
/// logged no-ops, isolated per trade and per check.
pub async fn advise_cycle(state: &Arc<AppState>) {
    let trades = state.ledger.with_status(&TradeStatus::Active);
    if trades.is_empty() {
        return;
    }

    debug!(count = trades.len(), "advisor pass started");

    for (i, trade) in trades.iter().enumerate() {
        if i > 0 {
            sleep(Duration::from_secs(INTER_TRADE_DELAY_SECS)).await;
        }

        if let Err(e) = check_weakness(state, &trade.id).await {
            warn!(id = %trade.id, symbol = %trade.symbol, error = %e, "weakness check skipped");
        }
        if let Err(e) = extend_momentum(state, &trade.id).await {
            warn!(id = %trade.id, symbol = %trade.symbol, error = %e, "momentum extension skipped");
        }
    }
}

// ---------------------------------------------------------------------------
// Weakness check
// ---------------------------------------------------------------------------

/// Close (or advise closing) a trade whose symbol is weak while the broad
/// market is losing momentum.
pub async fn check_weakness(state: &Arc<AppState>, trade_id: &str) -> Result<()> {
    let Some(trade) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if trade.status != TradeStatus::Active {
        return Ok(());
    }

    let config = state.config_snapshot();

    let candles = state
        .exchange
        .fetch_klines(&trade.symbol, ANALYSIS_INTERVAL, ANALYSIS_KLINE_LIMIT)
        .await?;
    let closes = Candle::closes(&candles);

    let price = *closes
        .last()
        .with_context(|| format!("empty kline response for {}", trade.symbol))?;
    let fast = ma::latest_sma(&closes, FAST_MA_PERIOD)
        .with_context(|| format!("not enough candles for MA{FAST_MA_PERIOD}"))?;
    let slow = ma::latest_sma(&closes, SLOW_MA_PERIOD)
        .with_context(|| format!("not enough candles for MA{SLOW_MA_PERIOD}"))?;

    if price >= fast || price >= slow {
        debug!(symbol = %trade.symbol, price, fast, slow, "no weakness");
        return Ok(());
    }

    // Confirm against broad-market momentum before acting.
    let reference = state
        .exchange
        .fetch_klines(&config.reference_symbol, ANALYSIS_INTERVAL, ANALYSIS_KLINE_LIMIT)
        .await?;
    let reference_roc = roc::current_roc(&Candle::closes(&reference), REFERENCE_ROC_PERIOD)
        .with_context(|| format!("not enough candles for {} ROC", config.reference_symbol))?;

    if reference_roc >= 0.0 {
        debug!(
            symbol = %trade.symbol,
            reference = %config.reference_symbol,
            reference_roc,
            "weakness not confirmed by market momentum"
        );
        return Ok(());
    }

    info!(
        id = trade_id,
        symbol = %trade.symbol,
        price,
        fast,
        slow,
        reference_roc,
        auto_close = config.auto_close_on_weakness,
        "confirmed weakness"
    );

    if config.auto_close_on_weakness {
        let _guard = state.lock_symbol(&trade.symbol).await;

        // Re-check under the lock — a tick may have closed the trade already.
        let Some(current) = state.ledger.get(trade_id) else {
            return Ok(());
        };
        if current.status != TradeStatus::Active {
            return Ok(());
        }

        // Mark first so the exit intent survives a crash mid-closure.
        state
            .ledger
            .update(trade_id, |t| t.status = TradeStatus::ForceExit)?;
        closure::execute(state, trade_id, CloseReason::ForceExit).await
    } else {
        state
            .notifier
            .send(&format!(
                "⚠️ {} weakening: {price:.4} below MA{FAST_MA_PERIOD}/MA{SLOW_MA_PERIOD} \
                 with negative market momentum ({reference_roc:.2}%) — consider exiting",
                trade.symbol
            ))
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Momentum extension
// ---------------------------------------------------------------------------

/// Extend the take-profit of a trade riding a strong trend.
pub async fn extend_momentum(state: &Arc<AppState>, trade_id: &str) -> Result<()> {
    let Some(trade) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if trade.status != TradeStatus::Active {
        return Ok(());
    }

    let config = state.config_snapshot();

    let candles = state
        .exchange
        .fetch_klines(&trade.symbol, ANALYSIS_INTERVAL, ANALYSIS_KLINE_LIMIT)
        .await?;

    let trend_strength = adx::calculate_adx(&candles, ADX_PERIOD)
        .with_context(|| format!("not enough candles for {} ADX", trade.symbol))?;

    if trend_strength <= config.strong_trend_adx {
        debug!(
            symbol = %trade.symbol,
            adx = trend_strength,
            threshold = config.strong_trend_adx,
            "trend not strong enough to extend"
        );
        return Ok(());
    }

    let volatility = atr::calculate_atr(&candles, ATR_PERIOD)
        .with_context(|| format!("not enough candles for {} ATR", trade.symbol))?;
    let price = state.exchange.ticker_price(&trade.symbol).await?;

    let candidate = price + volatility * config.reward_ratio;

    let _guard = state.lock_symbol(&trade.symbol).await;

    let Some(current) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if current.status != TradeStatus::Active {
        return Ok(());
    }
    // Targets only move up.
    if candidate <= current.take_profit {
        debug!(
            symbol = %trade.symbol,
            candidate,
            take_profit = current.take_profit,
            "candidate target below current — keeping"
        );
        return Ok(());
    }

    state
        .ledger
        .update(trade_id, |t| t.take_profit = candidate)?;

    info!(
        id = trade_id,
        symbol = %trade.symbol,
        adx = trend_strength,
        atr = volatility,
        old_target = current.take_profit,
        new_target = candidate,
        "take-profit extended on strong trend"
    );
    state
        .notifier
        .send(&format!(
            "🚀 {} strong trend (ADX {trend_strength:.1}) — target raised {:.4} → {candidate:.4}",
            trade.symbol, current.take_profit
        ))
        .await;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::testutil::state_with_mock;
    use crate::exchange::mock::MockExchange;
    use crate::ledger::Trade;

    fn flat_candles(level: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|_| Candle::new(0, level, level + 0.5, level - 0.5, level, 1.0, 0))
            .collect()
    }

    /// Candles drifting down so the last close sits below both MAs.
    fn weak_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 200.0 - i as f64;
                Candle::new(0, c + 1.0, c + 1.5, c - 0.5, c, 1.0, 0)
            })
            .collect()
    }

    /// Strongly trending candles: high ADX and a meaningful ATR.
    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                Candle::new(0, base, base + 1.5, base - 0.5, base + 1.0, 1.0, 0)
            })
            .collect()
    }

    fn active_trade(symbol: &str) -> Trade {
        Trade::new(symbol, 100.0, 2.0, 95.0, 120.0, "ema_trend")
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_weakness_advises_without_auto_close() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", weak_candles(60));
        exchange.set_klines("BTCUSDT", weak_candles(60)); // negative reference ROC

        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        check_weakness(&state, &id).await.unwrap();

        // Advisory only: trade untouched, one warning message, no sell.
        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Active);
        assert_eq!(exchange.sells(), 0);
        let sent = state.notifier.sent_messages();
        assert_eq!(sent.iter().filter(|m| m.contains("weakening")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_weakness_liquidates_when_auto_close_enabled() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", weak_candles(60));
        exchange.set_klines("BTCUSDT", weak_candles(60));
        exchange.set_price("SOLUSDT", 140.0);
        exchange.script_free_balance("SOL", vec![2.0]);

        let state = state_with_mock(exchange.clone());
        state.config.write().auto_close_on_weakness = true;

        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        check_weakness(&state, &id).await.unwrap();

        let closed = state.ledger.get(&id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed(CloseReason::ForceExit));
        assert_eq!(exchange.sells(), 1);
        // Auto-close must not also send the advisory.
        let sent = state.notifier.sent_messages();
        assert!(!sent.iter().any(|m| m.contains("consider exiting")));
    }

    #[tokio::test]
    async fn weakness_unconfirmed_by_market_momentum_is_noop() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", weak_candles(60));
        exchange.set_klines("BTCUSDT", trending_candles(60)); // positive reference ROC

        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        check_weakness(&state, &id).await.unwrap();

        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Active);
        assert!(state.notifier.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn no_weakness_when_price_above_mas() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", trending_candles(60));

        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        check_weakness(&state, &id).await.unwrap();
        assert!(state.notifier.sent_messages().is_empty());
        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Active);
    }

    #[tokio::test]
    async fn momentum_extension_raises_target_monotonically() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", trending_candles(60));
        exchange.set_price("SOLUSDT", 220.0);

        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        extend_momentum(&state, &id).await.unwrap();

        let row = state.ledger.get(&id).unwrap();
        // Raised above the original 120 target.
        assert!(row.take_profit > 120.0);
        let first_target = row.take_profit;

        // Re-running with a lower price must not pull the target back down.
        exchange.set_price("SOLUSDT", 100.0);
        extend_momentum(&state, &id).await.unwrap();
        assert!(state.ledger.get(&id).unwrap().take_profit >= first_target);
    }

    #[tokio::test]
    async fn weak_trend_leaves_target_alone() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_klines("SOLUSDT", flat_candles(100.0, 60));
        exchange.set_price("SOLUSDT", 100.0);

        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        extend_momentum(&state, &id).await.unwrap();
        assert!((state.ledger.get(&id).unwrap().take_profit - 120.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_degrades_to_logged_noop() {
        let exchange = Arc::new(MockExchange::new());
        // No klines scripted anywhere: both checks fail their fetches.
        let state = state_with_mock(exchange.clone());
        let trade = active_trade("SOLUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        advise_cycle(&state).await;

        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Active);
        assert!(state.notifier.sent_messages().is_empty());
        assert_eq!(exchange.sells(), 0);
    }
}
