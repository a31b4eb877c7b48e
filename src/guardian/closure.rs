// =============================================================================
// Hardened Closure — exactly-once liquidation protocol
// =============================================================================
//
// Callers MUST hold the per-symbol lifecycle lock.  The protocol:
//
//   for attempt in 1..=max_close_retries {
//       1. cancel every open order on the symbol      (idempotent)
//       2. settlement poll: wait until the free base-asset balance covers
//          the position (quantity * 0.98), up to 5 polls 1 s apart
//       3. market-sell the precision-adjusted quantity
//       4. compute pnl = (fill - entry) * quantity
//       5. mark the row terminal (single-shot by construction)
//       6. notify the outcome
//       7. spawn subscription resync + journal hand-off — never awaited,
//          never able to fail the closure
//   }
//   exhausted -> status Incubated, exactly ONE critical alert, resync fires
//
// Exactly-once: the terminal transition is guarded by the ledger (a second
// `mark_closed` fails) and a re-invocation on an incubated trade re-enters
// through the settlement gate — once the first sell confirmed, the base
// balance is gone and the gate can never pass again, so no second sell.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::ledger::{CloseReason, Trade, TradeStatus};

/// Delay between outer closure attempts.
const CLOSE_RETRY_DELAY_SECS: u64 = 5;

/// Settlement polls per attempt, and the delay between them.
const SETTLEMENT_POLLS: u32 = 5;
const SETTLEMENT_POLL_DELAY_SECS: u64 = 1;

/// Fraction of the recorded quantity the free balance must cover before we
/// consider the position settled and sellable (dust / fee tolerance).
const SETTLEMENT_TOLERANCE: f64 = 0.98;

/// Base asset of `symbol` given the quote it settles in ("SOLUSDT"/"USDT" ->
/// "SOL").  Falls back to the full symbol when the suffix does not match.
fn base_asset<'a>(symbol: &'a str, quote_asset: &str) -> &'a str {
    symbol.strip_suffix(quote_asset).unwrap_or(symbol)
}

/// Run the hardened closure protocol for `trade_id`.
///
/// Early no-op when the trade is already terminal, making re-invocation safe.
/// The caller holds the symbol's lifecycle lock for the whole call.
pub async fn execute(state: &Arc<AppState>, trade_id: &str, reason: CloseReason) -> Result<()> {
    let trade = state
        .ledger
        .get(trade_id)
        .with_context(|| format!("trade {trade_id} not found for closure"))?;

    if trade.status.is_terminal() {
        debug!(id = trade_id, status = %trade.status, "closure no-op: already terminal");
        return Ok(());
    }

    let config = state.config_snapshot();
    let base = base_asset(&trade.symbol, &config.quote_asset);

    info!(
        id = trade_id,
        symbol = %trade.symbol,
        reason = %reason,
        quantity = trade.quantity,
        "hardened closure started"
    );

    for attempt in 1..=config.max_close_retries {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_secs(CLOSE_RETRY_DELAY_SECS)).await;
        }

        match attempt_liquidation(state, &trade, base).await {
            Ok(fill_price) => {
                return finalize(state, &trade, reason, fill_price).await;
            }
            Err(e) => {
                warn!(
                    id = trade_id,
                    symbol = %trade.symbol,
                    attempt,
                    max = config.max_close_retries,
                    error = %e,
                    "closure attempt failed"
                );
            }
        }
    }

    incubate(state, &trade, &reason).await
}

/// One liquidation attempt: cancel, settle, sell.  Returns the fill price.
async fn attempt_liquidation(state: &Arc<AppState>, trade: &Trade, base: &str) -> Result<f64> {
    state
        .exchange
        .cancel_all_orders(&trade.symbol)
        .await
        .with_context(|| format!("cancel_all_orders failed for {}", trade.symbol))?;

    let settled = settle(state, trade, base).await?;

    let quantity = state
        .exchange
        .amount_to_precision(&trade.symbol, trade.quantity.min(settled));
    if quantity <= 0.0 {
        bail!("precision-adjusted quantity for {} is zero", trade.symbol);
    }

    state
        .exchange
        .market_sell(&trade.symbol, quantity)
        .await
        .with_context(|| format!("market sell failed for {}", trade.symbol))
}

/// Poll the free base-asset balance until it covers the position.  Returns
/// the observed free balance, or fails the attempt after the last poll.
async fn settle(state: &Arc<AppState>, trade: &Trade, base: &str) -> Result<f64> {
    let required = trade.quantity * SETTLEMENT_TOLERANCE;

    for poll in 1..=SETTLEMENT_POLLS {
        let free = state
            .exchange
            .free_balance(base)
            .await
            .with_context(|| format!("free balance lookup failed for {base}"))?;

        if free >= required {
            debug!(symbol = %trade.symbol, free, required, poll, "settlement confirmed");
            return Ok(free);
        }

        debug!(symbol = %trade.symbol, free, required, poll, "awaiting settlement");
        if poll < SETTLEMENT_POLLS {
            tokio::time::sleep(Duration::from_secs(SETTLEMENT_POLL_DELAY_SECS)).await;
        }
    }

    bail!(
        "settlement not confirmed for {} after {SETTLEMENT_POLLS} polls (need {required} {base})",
        trade.symbol
    )
}

/// Record the terminal outcome, notify, and kick off the detached side
/// effects.
async fn finalize(
    state: &Arc<AppState>,
    trade: &Trade,
    reason: CloseReason,
    fill_price: f64,
) -> Result<()> {
    let pnl = (fill_price - trade.entry_price) * trade.quantity;

    let closed = state
        .ledger
        .mark_closed(&trade.id, reason, fill_price, pnl)?;

    let pct = closed.pnl_pct().unwrap_or(0.0);
    state
        .notifier
        .send(&format!(
            "{} {} closed at {fill_price:.4} ({}) — pnl {pnl:+.2} ({pct:+.2}%)",
            if pnl >= 0.0 { "✅" } else { "🔻" },
            closed.symbol,
            closed.status,
        ))
        .await;

    // Detached side effects: never awaited, never able to fail the closure.
    let side_state = state.clone();
    tokio::spawn(async move {
        side_state.subscriptions.resync(&side_state.ledger);
    });
    state.journal.hand_off(closed);

    Ok(())
}

/// All attempts exhausted: park the trade for the supervisor and raise
/// exactly one critical alert.
async fn incubate(state: &Arc<AppState>, trade: &Trade, reason: &CloseReason) -> Result<()> {
    error!(
        id = %trade.id,
        symbol = %trade.symbol,
        reason = %reason,
        "closure exhausted all retries — incubating trade"
    );

    state
        .ledger
        .update(&trade.id, |t| t.status = TradeStatus::Incubated)
        .with_context(|| format!("failed to incubate trade {}", trade.id))?;

    state
        .notifier
        .send_critical(&format!(
            "{} closure failed after retries ({reason}) — trade incubated, manual check advised",
            trade.symbol
        ))
        .await;

    let side_state = state.clone();
    tokio::spawn(async move {
        side_state.subscriptions.resync(&side_state.ledger);
    });

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

    fn trade() -> Trade {
        Trade::new("SOLUSDT", 100.0, 2.0, 95.0, 120.0, "breakout")
    }

    #[test]
    fn base_asset_strips_quote_suffix() {
        assert_eq!(base_asset("SOLUSDT", "USDT"), "SOL");
        assert_eq!(base_asset("BTCUSDT", "USDT"), "BTC");
        assert_eq!(base_asset("WEIRD", "USDT"), "WEIRD");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_sells_once_and_records_economics() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 110.0);
        exchange.script_free_balance("SOL", vec![2.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::TakeProfit).await.unwrap();

        let closed = state.ledger.get(&id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed(CloseReason::TakeProfit));
        assert_eq!(closed.close_price, Some(110.0));
        assert!((closed.pnl.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(exchange.sells(), 1);
        assert_eq!(exchange.cancels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_waits_through_polls() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 110.0);
        // Balance lands on the third poll.
        exchange.script_free_balance("SOL", vec![0.0, 0.5, 2.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::StopLoss).await.unwrap();

        assert!(state.ledger.get(&id).unwrap().status.is_terminal());
        assert_eq!(exchange.sells(), 1);
        assert_eq!(exchange.balance_polls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_settlement_incubates_with_one_critical_and_zero_sells() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 90.0);
        // Never settles.
        exchange.script_free_balance("SOL", vec![0.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::StopLoss).await.unwrap();

        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Incubated);
        assert_eq!(exchange.sells(), 0);
        // 3 attempts x 5 settlement polls.
        assert_eq!(
            exchange.balance_polls.load(std::sync::atomic::Ordering::SeqCst),
            15
        );

        let criticals = state
            .notifier
            .sent_messages()
            .into_iter()
            .filter(|m| m.contains("CRITICAL"))
            .count();
        assert_eq!(criticals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_failures_retry_then_incubate() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 90.0);
        exchange.script_free_balance("SOL", vec![2.0]);
        exchange
            .fail_cancel
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::StopLoss).await.unwrap();

        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Incubated);
        assert_eq!(exchange.cancels(), 3);
        assert_eq!(exchange.sells(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_trade_is_a_noop() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 110.0);
        exchange.script_free_balance("SOL", vec![2.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::TakeProfit).await.unwrap();
        assert_eq!(exchange.sells(), 1);

        // Second invocation must not touch the exchange at all.
        execute(&state, &id, CloseReason::StopLoss).await.unwrap();
        assert_eq!(exchange.sells(), 1);
        assert_eq!(exchange.cancels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn incubated_reinvocation_never_double_sells() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 90.0);
        exchange.script_free_balance("SOL", vec![0.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        execute(&state, &id, CloseReason::StopLoss).await.unwrap();
        assert_eq!(state.ledger.get(&id).unwrap().status, TradeStatus::Incubated);

        // The position sold out-of-band in the meantime: the base balance is
        // gone, so the settlement gate can never pass and no sell fires.
        execute(&state, &id, CloseReason::Supervisor).await.unwrap();
        assert_eq!(exchange.sells(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sell_failure_retries_and_eventually_succeeds() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("SOLUSDT", 96.0);
        exchange.script_free_balance("SOL", vec![2.0]);
        exchange
            .fail_sell
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        // Flip the sell back to healthy after the retry delay of attempt 1.
        let flip = exchange.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            flip.fail_sell
                .store(false, std::sync::atomic::Ordering::SeqCst);
        });

        execute(&state, &id, CloseReason::StopLoss).await.unwrap();

        assert!(state.ledger.get(&id).unwrap().status.is_terminal());
        assert_eq!(exchange.sells(), 1);
        assert_eq!(exchange.cancels(), 2);
    }
}
