// =============================================================================
// Trade Journal — append-only hand-off of finalized trades
// =============================================================================
//
// Every terminal closure hands the finished row to the journal as a spawned,
// unsupervised task: the closure path never waits for — or fails because of —
// journaling.  Records are JSON lines, one finalized trade per line, so the
// file can be replayed by external what-if tooling.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ledger::Trade;

/// Append-only JSON-lines journal of finalized trades.
pub struct TradeJournal {
    path: Option<PathBuf>,
    /// Serialises concurrent appends from spawned hand-off tasks.
    write_guard: Mutex<()>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_guard: Mutex::new(()),
        }
    }

    /// Journal that drops every record (used in tests and when journaling is
    /// not configured).
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_guard: Mutex::new(()),
        }
    }

    /// Append one finalized trade.  Callers on the closure path must invoke
    /// this via [`TradeJournal::hand_off`] instead.
    pub fn append(&self, trade: &Trade) -> Result<()> {
        let Some(path) = &self.path else {
            debug!(id = %trade.id, "journal disabled — record dropped");
            return Ok(());
        };

        let line = serde_json::to_string(trade).context("failed to serialise trade record")?;

        let _guard = self.write_guard.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open journal at {}", path.display()))?;

        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to journal at {}", path.display()))?;

        debug!(id = %trade.id, status = %trade.status, "trade journaled");
        Ok(())
    }

    /// Fire-and-forget hand-off from the closure path.  Failure is logged,
    /// never propagated.
    pub fn hand_off(self: &std::sync::Arc<Self>, trade: Trade) {
        let journal = self.clone();
        tokio::spawn(async move {
            if let Err(e) = journal.append(&trade) {
                warn!(id = %trade.id, error = %e, "journal hand-off failed");
            }
        });
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("path", &self.path)
            .finish()
    }
}
