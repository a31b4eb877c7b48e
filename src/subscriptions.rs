// =============================================================================
// Subscription Set — symbols under live price watch
// =============================================================================
//
// The price-poll loop in main drives guardian ticks for exactly this set.
// After every closure attempt (success or incubation) the set is reconciled
// against the ledger so that terminal trades stop consuming price polls and
// recovered trades resume receiving them.
// =============================================================================

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::ledger::TradeLedger;

/// Shared set of symbols that need live prices.
pub struct SubscriptionSet {
    symbols: RwLock<HashSet<String>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashSet::new()),
        }
    }

    /// Snapshot of the current watch set, sorted for deterministic iteration.
    pub fn snapshot(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.read().contains(symbol)
    }

    /// Reconcile the watch set with the symbols of non-terminal ledger rows.
    pub fn resync(&self, ledger: &TradeLedger) {
        let wanted: HashSet<String> = ledger.watched_symbols().into_iter().collect();

        let mut current = self.symbols.write();
        if *current == wanted {
            debug!(count = current.len(), "subscription set already in sync");
            return;
        }

        let added: Vec<&String> = wanted.difference(&current).collect();
        let removed: Vec<&String> = current.difference(&wanted).collect();
        info!(?added, ?removed, "subscription set resynced");

        *current = wanted;
    }
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}
