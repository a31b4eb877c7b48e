// =============================================================================
// Supervisor — recovery of incubated trades
// =============================================================================
//
// A trade lands in `Incubated` when hardened closure exhausted its retries.
// The position may or may not still exist on the exchange; the supervisor
// periodically decides, per trade, between two outcomes:
//
//   price > stop_loss   -> the close trigger no longer holds: revert the
//                          trade to Active and let the guardian watch it
//   price <= stop_loss  -> the trigger still holds: re-run hardened closure
//                          with the Supervisor reason
//
// Per-trade failures are logged and skipped; a short politeness delay sits
// between trades so a long incubation backlog does not burst the rate limit.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::guardian::closure;
use crate::ledger::{CloseReason, TradeStatus};

/// Delay between consecutive incubated trades in one pass.
const INTER_TRADE_DELAY_SECS: u64 = 2;

/// Periodic supervisor loop.
pub async fn run_supervisor(state: Arc<AppState>) {
    let period = state.config_snapshot().supervisor_interval_secs;
    let mut ticker = interval(Duration::from_secs(period.max(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        supervise_cycle(&state).await;
    }
}

/// One pass over every incubated trade.
pub async fn supervise_cycle(state: &Arc<AppState>) {
    let incubated = state.ledger.with_status(&TradeStatus::Incubated);
    if incubated.is_empty() {
        return;
    }

    info!(count = incubated.len(), "supervisor pass over incubated trades");

    for (i, trade) in incubated.iter().enumerate() {
        if i > 0 {
            sleep(Duration::from_secs(INTER_TRADE_DELAY_SECS)).await;
        }

        if let Err(e) = supervise_trade(state, &trade.id).await {
            warn!(id = %trade.id, symbol = %trade.symbol, error = %e, "supervision failed");
        }
    }
}

/// Decide one incubated trade's fate against the current price.
pub async fn supervise_trade(state: &Arc<AppState>, trade_id: &str) -> Result<()> {
    // Fetch the price before taking the lock; a slow ticker call must not
    // stall guardian ticks on the same symbol.
    let Some(trade) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if trade.status != TradeStatus::Incubated {
        return Ok(());
    }

    let price = state.exchange.ticker_price(&trade.symbol).await?;

    let _guard = state.lock_symbol(&trade.symbol).await;

    // Re-read under the lock — the row may have moved while we fetched.
    let Some(trade) = state.ledger.get(trade_id) else {
        return Ok(());
    };
    if trade.status != TradeStatus::Incubated {
        debug!(id = trade_id, status = %trade.status, "trade moved on — skipping");
        return Ok(());
    }

    if price > trade.stop_loss {
        state
            .ledger
            .update(trade_id, |t| t.status = TradeStatus::Active)?;

        info!(
            id = trade_id,
            symbol = %trade.symbol,
            price,
            stop_loss = trade.stop_loss,
            "incubated trade recovered to active"
        );
        state
            .notifier
            .send(&format!(
                "♻️ {} recovered from incubation at {price:.4} — monitoring resumed",
                trade.symbol
            ))
            .await;
        return Ok(());
    }

    info!(
        id = trade_id,
        symbol = %trade.symbol,
        price,
        stop_loss = trade.stop_loss,
        "close trigger still holds — retrying closure"
    );
    closure::execute(state, trade_id, CloseReason::Supervisor).await
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

    fn incubated_trade(symbol: &str) -> Trade {
        let mut trade = Trade::new(symbol, 100.0, 2.0, 95.0, 120.0, "ema_trend");
        trade.status = TradeStatus::Incubated;
        trade
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_when_price_back_above_stop() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTCUSDT", 101.0);

        let state = state_with_mock(exchange.clone());
        let trade = incubated_trade("BTCUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        supervise_cycle(&state).await;

        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Active);
        // Recovery must not touch the exchange beyond the price lookup.
        assert_eq!(exchange.sells(), 0);
        assert_eq!(exchange.cancels(), 0);

        let sent = state.notifier.sent_messages();
        assert!(sent.iter().any(|m| m.contains("recovered from incubation")));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_closure_when_trigger_still_holds() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTCUSDT", 90.0);
        exchange.script_free_balance("BTC", vec![2.0]);

        let state = state_with_mock(exchange.clone());
        let trade = incubated_trade("BTCUSDT");
        let id = trade.id.clone();
        state.ledger.insert(trade).unwrap();

        supervise_cycle(&state).await;

        let closed = state.ledger.get(&id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed(CloseReason::Supervisor));
        assert_eq!(closed.close_price, Some(90.0));
        assert_eq!(exchange.sells(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn price_failure_isolates_to_one_trade() {
        let exchange = Arc::new(MockExchange::new());
        // Only ETHUSDT has a price; the BTCUSDT lookup fails.
        exchange.set_price("ETHUSDT", 101.0);

        let state = state_with_mock(exchange.clone());
        let stuck = incubated_trade("BTCUSDT");
        let fine = incubated_trade("ETHUSDT");
        let stuck_id = stuck.id.clone();
        let fine_id = fine.id.clone();
        state.ledger.insert(stuck).unwrap();
        state.ledger.insert(fine).unwrap();

        supervise_cycle(&state).await;

        // The failing trade stays incubated; the healthy one recovers.
        assert_eq!(
            state.ledger.get(&stuck_id).unwrap().status,
            TradeStatus::Incubated
        );
        assert_eq!(
            state.ledger.get(&fine_id).unwrap().status,
            TradeStatus::Active
        );
    }

    #[tokio::test]
    async fn active_trades_are_ignored() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTCUSDT", 90.0);

        let state = state_with_mock(exchange.clone());
        let trade = Trade::new("BTCUSDT", 100.0, 2.0, 95.0, 120.0, "ema_trend");
        state.ledger.insert(trade).unwrap();

        supervise_cycle(&state).await;
        assert_eq!(exchange.cancels(), 0);
    }
}
