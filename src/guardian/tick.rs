// =============================================================================
// Tick Evaluation — priority cascade over one live price
// =============================================================================
//
// Priority order (first closing decision wins, rest is skipped):
//   1. hard stop-loss            price <= stop_loss
//   2. scalp target (config)     price >= entry * (1 + scalp_target_pct)
//   3. take-profit               price >= take_profit
//   4. trailing-stop management  ratchet highest / raise stop
//   5. incremental notification  price >= last_notified * (1 + increment)
//
// A stop-loss hit while the trailing stop is active AND price sits above the
// entry is not a loss — it is the trailing stop harvesting gains, so the
// close is reclassified as `ProtectedProfit`.
//
// Steps 4 and 5 mutate the row; all mutations of one tick persist together in
// a single ledger update so a crash can never leave a half-applied tick.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::guardian::closure;
use crate::ledger::{CloseReason, Trade};
use crate::runtime_config::GuardianConfig;

/// Fractional offset above entry used when the trailing stop first activates.
/// The stop jumps to break-even plus a sliver so the trade can no longer lose.
const BREAKEVEN_OFFSET: f64 = 0.001;

// ---------------------------------------------------------------------------
// Pure evaluation
// ---------------------------------------------------------------------------

/// Row mutations produced by a non-closing tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RowUpdate {
    pub highest_price: f64,
    pub stop_loss: f64,
    pub trailing_stop_active: bool,
    pub last_notified_price: f64,
    /// The trailing stop activated on this tick.
    pub activated: bool,
    /// The trailing stop moved up on this tick.
    pub ratcheted: bool,
    /// An incremental profit notification is due.
    pub notify_profit: bool,
}

/// Outcome of evaluating a single tick against a trade row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TickAction {
    Close(CloseReason),
    Update(RowUpdate),
    Hold,
}

/// Evaluate the cascade.  Pure — no IO, no locks.
pub(crate) fn evaluate(trade: &Trade, config: &GuardianConfig, price: f64) -> TickAction {
    // 1. Hard stop-loss.
    if price <= trade.stop_loss {
        let reason = if trade.trailing_stop_active && price > trade.entry_price {
            CloseReason::ProtectedProfit
        } else {
            CloseReason::StopLoss
        };
        return TickAction::Close(reason);
    }

    // 2. Scalp target.
    if config.scalp_mode
        && price > trade.entry_price
        && price >= trade.entry_price * (1.0 + config.scalp_target_pct)
    {
        return TickAction::Close(CloseReason::Scalp);
    }

    // 3. Take-profit.
    if price >= trade.take_profit {
        return TickAction::Close(CloseReason::TakeProfit);
    }

    // 4. Trailing-stop management.
    let mut update = RowUpdate {
        highest_price: trade.highest_price.max(price),
        stop_loss: trade.stop_loss,
        trailing_stop_active: trade.trailing_stop_active,
        last_notified_price: trade.last_notified_price,
        activated: false,
        ratcheted: false,
        notify_profit: false,
    };

    if !update.trailing_stop_active
        && price >= trade.entry_price * (1.0 + config.trailing_activation_pct)
    {
        update.trailing_stop_active = true;
        update.activated = true;
        let breakeven = trade.entry_price * (1.0 + BREAKEVEN_OFFSET);
        if breakeven > update.stop_loss {
            update.stop_loss = breakeven;
        }
    }

    // The callback ratchet starts on the tick AFTER activation: the
    // activation tick itself only lifts the stop to break-even.
    if trade.trailing_stop_active {
        let candidate = update.highest_price * (1.0 - config.trailing_callback_pct);
        if candidate > update.stop_loss {
            update.stop_loss = candidate;
            update.ratcheted = true;
        }
    }

    // 5. Incremental profit notification.
    if price >= trade.last_notified_price * (1.0 + config.notify_increment_pct) {
        update.last_notified_price = price;
        update.notify_profit = true;
    }

    let unchanged = update.highest_price == trade.highest_price
        && update.stop_loss == trade.stop_loss
        && update.trailing_stop_active == trade.trailing_stop_active
        && update.last_notified_price == trade.last_notified_price;

    if unchanged {
        TickAction::Hold
    } else {
        TickAction::Update(update)
    }
}

// ---------------------------------------------------------------------------
// Tick entry point
// ---------------------------------------------------------------------------

/// Handle one live price for `symbol`.
///
/// No-op when the symbol has no active trade.  Runs the full evaluate/apply
/// sequence under the per-symbol lifecycle lock, so a tick can never race
/// another tick or a periodic job on the same symbol.
pub async fn on_price_tick(state: &Arc<AppState>, symbol: &str, price: f64) -> Result<()> {
    if !price.is_finite() || price <= 0.0 {
        warn!(symbol, price, "discarding bogus tick");
        return Ok(());
    }

    // Cheap pre-check outside the lock; re-read inside before acting.
    if state.ledger.active_for_symbol(symbol).is_none() {
        return Ok(());
    }

    let _guard = state.lock_symbol(symbol).await;

    let Some(trade) = state.ledger.active_for_symbol(symbol) else {
        return Ok(());
    };

    let config = state.config_snapshot();

    match evaluate(&trade, &config, price) {
        TickAction::Close(reason) => {
            info!(
                symbol,
                price,
                stop_loss = trade.stop_loss,
                take_profit = trade.take_profit,
                reason = %reason,
                "tick triggered close"
            );
            closure::execute(state, &trade.id, reason).await
        }
        TickAction::Update(update) => {
            apply_update(state, &trade, price, update).await
        }
        TickAction::Hold => {
            debug!(symbol, price, "tick held");
            Ok(())
        }
    }
}

/// Persist all row mutations of this tick in one ledger update, then emit the
/// notifications they call for.
async fn apply_update(
    state: &Arc<AppState>,
    trade: &Trade,
    price: f64,
    update: RowUpdate,
) -> Result<()> {
    state.ledger.update(&trade.id, |t| {
        t.highest_price = update.highest_price;
        t.stop_loss = update.stop_loss;
        t.trailing_stop_active = update.trailing_stop_active;
        t.last_notified_price = update.last_notified_price;
    })?;

    if update.activated {
        info!(
            symbol = %trade.symbol,
            price,
            stop_loss = update.stop_loss,
            "trailing stop activated"
        );
        state
            .notifier
            .send(&format!(
                "🔒 {} trailing stop activated at {price:.4} — stop moved to {:.4}",
                trade.symbol, update.stop_loss
            ))
            .await;
    } else if update.ratcheted {
        debug!(
            symbol = %trade.symbol,
            price,
            stop_loss = update.stop_loss,
            "trailing stop ratcheted"
        );
    }

    if update.notify_profit {
        let gain_pct = (price - trade.entry_price) / trade.entry_price * 100.0;
        state
            .notifier
            .send(&format!(
                "📈 {} at {price:.4} ({gain_pct:+.2}% from entry)",
                trade.symbol
            ))
            .await;
    }

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
    use crate::ledger::{Trade, TradeStatus};

    fn trade() -> Trade {
        // entry 100, qty 2, stop 95, target 120
        Trade::new("BTCUSDT", 100.0, 2.0, 95.0, 120.0, "ema_trend")
    }

    fn cfg() -> GuardianConfig {
        GuardianConfig::default()
    }

    // --- pure cascade ---------------------------------------------------------

    #[test]
    fn stop_loss_fires_at_or_below_stop() {
        assert_eq!(
            evaluate(&trade(), &cfg(), 95.0),
            TickAction::Close(CloseReason::StopLoss)
        );
        assert_eq!(
            evaluate(&trade(), &cfg(), 94.0),
            TickAction::Close(CloseReason::StopLoss)
        );
    }

    #[test]
    fn stop_loss_outranks_take_profit() {
        // Degenerate row where both levels are crossed at once: the stop wins.
        let mut t = trade();
        t.stop_loss = 110.0;
        t.take_profit = 105.0;
        assert_eq!(
            evaluate(&t, &cfg(), 108.0),
            TickAction::Close(CloseReason::StopLoss)
        );
    }

    #[test]
    fn trailing_stop_above_entry_is_protected_profit() {
        let mut t = trade();
        t.trailing_stop_active = true;
        t.stop_loss = 104.0;
        t.highest_price = 107.0;
        assert_eq!(
            evaluate(&t, &cfg(), 103.5),
            TickAction::Close(CloseReason::ProtectedProfit)
        );

        // Trailing active but price back under entry: a genuine stop-loss.
        t.stop_loss = 99.0;
        assert_eq!(
            evaluate(&t, &cfg(), 98.0),
            TickAction::Close(CloseReason::StopLoss)
        );
    }

    #[test]
    fn scalp_close_when_enabled() {
        let mut config = cfg();
        config.scalp_mode = true;
        // +0.8 % target on entry 100 => 100.8.
        assert_eq!(
            evaluate(&trade(), &config, 100.8),
            TickAction::Close(CloseReason::Scalp)
        );
        // Below the scalp target nothing closes.
        assert!(!matches!(
            evaluate(&trade(), &config, 100.5),
            TickAction::Close(_)
        ));
        // Scalp disabled: same price holds.
        assert!(!matches!(
            evaluate(&trade(), &cfg(), 100.8),
            TickAction::Close(_)
        ));
    }

    #[test]
    fn take_profit_close() {
        assert_eq!(
            evaluate(&trade(), &cfg(), 120.0),
            TickAction::Close(CloseReason::TakeProfit)
        );
    }

    #[test]
    fn trailing_activates_at_threshold_and_moves_stop_to_breakeven() {
        // Activation at entry * 1.05 = 105; tick at 106.
        let TickAction::Update(update) = evaluate(&trade(), &cfg(), 106.0) else {
            panic!("expected update");
        };
        assert!(update.trailing_stop_active);
        assert!(update.activated);
        // The activation tick only lifts the stop to entry * 1.001 = 100.1;
        // the callback ratchet starts on the next tick.
        assert!((update.stop_loss - 100.1).abs() < 1e-9);
        assert!(!update.ratcheted);
        assert!((update.highest_price - 106.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ratchet_starts_on_tick_after_activation() {
        // Activation tick: stop parks at break-even, 100.1.
        let TickAction::Update(update) = evaluate(&trade(), &cfg(), 106.0) else {
            panic!("expected update");
        };
        assert!((update.stop_loss - 100.1).abs() < 1e-9);

        // Next tick with the trailing stop active: the callback follows the
        // highest seen price.
        let mut t = trade();
        t.trailing_stop_active = true;
        t.stop_loss = update.stop_loss;
        t.highest_price = update.highest_price;

        let TickAction::Update(update) = evaluate(&t, &cfg(), 106.0) else {
            panic!("expected update");
        };
        assert!((update.stop_loss - 103.88).abs() < 1e-9); // 106 * 0.98
        assert!(update.ratcheted);
    }

    #[test]
    fn trailing_ratchet_follows_highest() {
        let mut t = trade();
        t.trailing_stop_active = true;
        t.highest_price = 110.0;
        t.stop_loss = 107.8; // 110 * 0.98

        let TickAction::Update(update) = evaluate(&t, &cfg(), 112.0) else {
            panic!("expected update");
        };
        assert!((update.highest_price - 112.0).abs() < f64::EPSILON);
        assert!((update.stop_loss - 109.76).abs() < 1e-9); // 112 * 0.98
        assert!(update.ratcheted);
    }

    #[test]
    fn stop_and_highest_never_decrease() {
        let mut t = trade();
        t.trailing_stop_active = true;
        t.highest_price = 112.0;
        t.stop_loss = 109.76;

        // Price dips but stays above the stop: nothing may move down.
        match evaluate(&t, &cfg(), 110.0) {
            TickAction::Hold => {}
            TickAction::Update(update) => {
                assert!(update.stop_loss >= t.stop_loss);
                assert!(update.highest_price >= t.highest_price);
            }
            TickAction::Close(reason) => panic!("unexpected close: {reason}"),
        }
    }

    #[test]
    fn profit_notification_at_increment() {
        // +1 % over last_notified (100) => 101.
        let TickAction::Update(update) = evaluate(&trade(), &cfg(), 101.0) else {
            panic!("expected update");
        };
        assert!(update.notify_profit);
        assert!((update.last_notified_price - 101.0).abs() < f64::EPSILON);

        // Just below the increment: highest still ratchets, no notification.
        let TickAction::Update(update) = evaluate(&trade(), &cfg(), 100.9) else {
            panic!("expected update");
        };
        assert!(!update.notify_profit);
        assert!((update.last_notified_price - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hold_when_nothing_moves() {
        let mut t = trade();
        t.highest_price = 100.5;
        assert_eq!(evaluate(&t, &cfg(), 100.2), TickAction::Hold);
    }

    // --- full tick path -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stop_loss_tick_closes_with_economics() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTCUSDT", 94.0);
        exchange.script_free_balance("BTC", vec![2.0]);

        let state = state_with_mock(exchange.clone());
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        on_price_tick(&state, "BTCUSDT", 94.0).await.unwrap();

        let closed = state.ledger.get(&id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed(CloseReason::StopLoss));
        assert_eq!(closed.close_price, Some(94.0));
        assert!((closed.pnl.unwrap() - (94.0 - 100.0) * 2.0).abs() < 1e-9);
        assert_eq!(exchange.sells(), 1);
    }

    #[tokio::test]
    async fn tick_without_active_trade_is_noop() {
        let exchange = Arc::new(MockExchange::new());
        let state = state_with_mock(exchange.clone());

        on_price_tick(&state, "BTCUSDT", 100.0).await.unwrap();
        assert_eq!(exchange.sells(), 0);
        assert_eq!(exchange.cancels(), 0);
    }

    #[tokio::test]
    async fn bogus_price_is_discarded() {
        let exchange = Arc::new(MockExchange::new());
        let state = state_with_mock(exchange.clone());
        state.ledger.insert(trade()).unwrap();

        on_price_tick(&state, "BTCUSDT", f64::NAN).await.unwrap();
        on_price_tick(&state, "BTCUSDT", 0.0).await.unwrap();
        on_price_tick(&state, "BTCUSDT", -5.0).await.unwrap();
        assert_eq!(exchange.cancels(), 0);
    }

    #[tokio::test]
    async fn trailing_activation_persists_and_notifies() {
        let exchange = Arc::new(MockExchange::new());
        let state = state_with_mock(exchange);
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        on_price_tick(&state, "BTCUSDT", 106.0).await.unwrap();

        let row = state.ledger.get(&id).unwrap();
        assert!(row.trailing_stop_active);
        assert!((row.stop_loss - 100.1).abs() < 1e-9);
        assert!((row.highest_price - 106.0).abs() < f64::EPSILON);

        let sent = state.notifier.sent_messages();
        assert!(sent.iter().any(|m| m.contains("trailing stop activated")));
    }

    #[tokio::test]
    async fn notification_increments_track_last_notified() {
        let exchange = Arc::new(MockExchange::new());
        let state = state_with_mock(exchange);
        let t = trade();
        let id = t.id.clone();
        state.ledger.insert(t).unwrap();

        on_price_tick(&state, "BTCUSDT", 101.0).await.unwrap();
        on_price_tick(&state, "BTCUSDT", 101.5).await.unwrap(); // below 101 * 1.01
        on_price_tick(&state, "BTCUSDT", 102.2).await.unwrap(); // above

        let row = state.ledger.get(&id).unwrap();
        assert!((row.last_notified_price - 102.2).abs() < f64::EPSILON);

        let profit_msgs = state
            .notifier
            .sent_messages()
            .into_iter()
            .filter(|m| m.contains("from entry"))
            .count();
        assert_eq!(profit_msgs, 2);
    }
}
