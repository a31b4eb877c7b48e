// =============================================================================
// Central Application State — Sentinel Trade Guardian
// =============================================================================
//
// Ties the subsystems together: config, ledger, exchange gateway, notifier,
// journal, subscription set, signal registry, and — critically — the
// per-symbol lifecycle locks.
//
// Concurrency contract: EVERY read-evaluate-write sequence over a trade row
// (guardian tick, supervisor recovery, advisor forced-exit/extension,
// reviewer invalidation) must run inside `lock_symbol`.  The guard is an
// owned tokio mutex guard so it can be held across the remote-call suspension
// points inside hardened closure.  Two ticks for the same symbol, or a tick
// racing a periodic job, can therefore never interleave a read and a stale
// write.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::exchange::ExchangeApi;
use crate::journal::TradeJournal;
use crate::ledger::TradeLedger;
use crate::notifier::Notifier;
use crate::reviewer::SignalRegistry;
use crate::runtime_config::GuardianConfig;
use crate::subscriptions::SubscriptionSet;

/// Central state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<parking_lot::RwLock<GuardianConfig>>,
    pub ledger: Arc<TradeLedger>,
    pub exchange: Arc<dyn ExchangeApi>,
    pub notifier: Arc<Notifier>,
    pub journal: Arc<TradeJournal>,
    pub subscriptions: Arc<SubscriptionSet>,
    pub signal_registry: Arc<SignalRegistry>,

    /// One async mutex per symbol — the trade-lifecycle serialization
    /// boundary.  The outer parking_lot mutex only guards the map itself.
    trade_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        config: GuardianConfig,
        ledger: Arc<TradeLedger>,
        exchange: Arc<dyn ExchangeApi>,
        notifier: Arc<Notifier>,
        journal: Arc<TradeJournal>,
    ) -> Self {
        Self {
            config: Arc::new(parking_lot::RwLock::new(config)),
            ledger,
            exchange,
            notifier,
            journal,
            subscriptions: Arc::new(SubscriptionSet::new()),
            signal_registry: Arc::new(SignalRegistry::new()),
            trade_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cloned configuration snapshot — consistent reads within one tick or
    /// job run even if the backing config is updated concurrently.
    pub fn config_snapshot(&self) -> GuardianConfig {
        self.config.read().clone()
    }

    /// Acquire the lifecycle lock for `symbol`.  The returned owned guard may
    /// be held across `.await` points.
    pub async fn lock_symbol(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.trade_locks.lock();
            locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("ledger", &self.ledger)
            .field("notifier", &self.notifier)
            .finish()
    }
}


// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;

    #[tokio::test]
    async fn symbol_locks_serialise_same_symbol_only() {
        let state = testutil::state_with_mock(Arc::new(MockExchange::new()));

        let guard_btc = state.lock_symbol("BTCUSDT").await;

        // A different symbol locks independently.
        let _guard_eth = state.lock_symbol("ETHUSDT").await;

        // The same symbol must wait until the first guard drops.
        let state2 = state.clone();
        let contended = tokio::spawn(async move {
            let _g = state2.lock_symbol("BTCUSDT").await;
        });

        tokio::task::yield_now().await;
        assert!(!contended.is_finished());

        drop(guard_btc);
        contended.await.unwrap();
    }

    #[test]
    fn config_snapshot_is_detached() {
        let state = testutil::state_with_mock(Arc::new(MockExchange::new()));
        let snapshot = state.config_snapshot();

        state.config.write().scalp_mode = true;
        assert!(!snapshot.scalp_mode);
        assert!(state.config_snapshot().scalp_mode);
    }
}
