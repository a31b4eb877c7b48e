// =============================================================================
// Trade Ledger — durable single source of truth for position rows
// =============================================================================
//
// Life-cycle:
//   Active  ->  Closed(reason)                       (guardian / advisor / reviewer)
//   Active  ->  ForceExit -> Closed(ForceExit)       (advisor weakness auto-close)
//   Active  ->  Incubated                            (hardened closure exhausted)
//   Incubated -> Active | Closed(Supervisor)         (supervisor recovery / retry)
//
// Terminal `Closed(_)` rows are immutable: `mark_closed` is the only path to
// a terminal status and refuses to touch a row that already carries one.
//
// Thread-safety: rows live behind `parking_lot::RwLock`; the per-symbol
// lifecycle locks in `AppState` serialise every read-evaluate-write sequence
// that spans remote calls.  Durability uses the same atomic tmp + rename
// pattern as the runtime config.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status model
// ---------------------------------------------------------------------------

/// Terminal close reasons — the `closed:*` family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    /// A stop-loss hit above entry while the trailing stop was active.
    ProtectedProfit,
    Scalp,
    TakeProfit,
    ForceExit,
    /// The original entry signal no longer validates; carries the strategy id.
    Reviewer(String),
    Supervisor,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "closed:stop_loss"),
            Self::ProtectedProfit => write!(f, "closed:protected_profit"),
            Self::Scalp => write!(f, "closed:scalp"),
            Self::TakeProfit => write!(f, "closed:take_profit"),
            Self::ForceExit => write!(f, "closed:force_exit"),
            Self::Reviewer(strategy) => write!(f, "closed:reviewer:{strategy}"),
            Self::Supervisor => write!(f, "closed:supervisor"),
        }
    }
}

/// Current status of a trade row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    /// Position open and monitored for exit.
    Active,
    /// A closure attempt failed to confirm; the position may still exist on
    /// the exchange.  Recoverable — owned by the supervisor.
    Incubated,
    /// Marked for liquidation by the tactical advisor.
    ForceExit,
    /// Terminal.  Never revisited.
    Closed(CloseReason),
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Incubated => write!(f, "incubated"),
            Self::ForceExit => write!(f, "force_exit"),
            Self::Closed(reason) => write!(f, "{reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade row
// ---------------------------------------------------------------------------

/// One tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Highest price seen since open — monotonically non-decreasing.
    pub highest_price: f64,
    #[serde(default)]
    pub trailing_stop_active: bool,
    /// Last price at which an incremental profit notification fired.
    pub last_notified_price: f64,
    /// Originating strategy identifier, possibly composite ("ema_trend + rsi").
    pub entry_reason: String,
    pub status: TradeStatus,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
}

impl Trade {
    /// Build a fresh active trade row.
    pub fn new(
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
        entry_reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            highest_price: entry_price,
            trailing_stop_active: false,
            last_notified_price: entry_price,
            entry_reason: entry_reason.to_string(),
            status: TradeStatus::Active,
            close_price: None,
            pnl: None,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
        }
    }

    /// Primary strategy identifier — the first `+`-separated token of
    /// `entry_reason`.
    pub fn primary_strategy(&self) -> &str {
        self.entry_reason
            .split('+')
            .next()
            .unwrap_or(&self.entry_reason)
            .trim()
    }

    /// Percentage return implied by `pnl` against the entry notional.
    pub fn pnl_pct(&self) -> Option<f64> {
        let pnl = self.pnl?;
        let notional = self.entry_price * self.quantity;
        if notional == 0.0 {
            return None;
        }
        Some((pnl / notional) * 100.0)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Thread-safe trade store with optional JSON-file durability.
pub struct TradeLedger {
    rows: RwLock<HashMap<String, Trade>>,
    /// When set, the full row map is flushed atomically after every mutation.
    path: Option<PathBuf>,
}

impl TradeLedger {
    /// Create an empty, memory-only ledger (used in tests).
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a ledger backed by the JSON file at `path`, loading any existing
    /// rows.  A missing file starts an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let rows: HashMap<String, Trade> = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse ledger file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read ledger file {}", path.display()))
            }
        };

        info!(path = %path.display(), rows = rows.len(), "trade ledger opened");

        Ok(Self {
            rows: RwLock::new(rows),
            path: Some(path),
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch a row by id.
    pub fn get(&self, id: &str) -> Option<Trade> {
        self.rows.read().get(id).cloned()
    }

    /// The unique active trade on `symbol`, if any.
    pub fn active_for_symbol(&self, symbol: &str) -> Option<Trade> {
        self.rows
            .read()
            .values()
            .find(|t| t.symbol == symbol && t.status == TradeStatus::Active)
            .cloned()
    }

    /// All rows currently carrying `status`.
    pub fn with_status(&self, status: &TradeStatus) -> Vec<Trade> {
        self.rows
            .read()
            .values()
            .filter(|t| &t.status == status)
            .cloned()
            .collect()
    }

    /// Symbols of all non-terminal rows — the set that needs live prices.
    pub fn watched_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .rows
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert a new row (entry placement — normally driven by the external
    /// entry flow).
    pub fn insert(&self, trade: Trade) -> Result<()> {
        info!(
            id = %trade.id,
            symbol = %trade.symbol,
            entry_price = trade.entry_price,
            quantity = trade.quantity,
            stop_loss = trade.stop_loss,
            take_profit = trade.take_profit,
            reason = %trade.entry_reason,
            "trade inserted"
        );
        self.rows.write().insert(trade.id.clone(), trade);
        self.flush()
    }

    /// Atomic read-modify-write of a single row.  The mutation closure runs
    /// under the write lock; the updated row is returned.
    ///
    /// Fails when the row is missing or already terminal.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Trade>
    where
        F: FnOnce(&mut Trade),
    {
        let updated = {
            let mut rows = self.rows.write();
            let trade = rows
                .get_mut(id)
                .with_context(|| format!("trade {id} not found in ledger"))?;

            if trade.status.is_terminal() {
                bail!("trade {id} is terminal ({}) — refusing update", trade.status);
            }

            mutate(trade);
            trade.clone()
        };

        self.flush()?;
        Ok(updated)
    }

    /// Transition a row to its terminal status, recording economics.  The only
    /// path to `Closed(_)`; a second call on the same row fails.
    pub fn mark_closed(
        &self,
        id: &str,
        reason: CloseReason,
        close_price: f64,
        pnl: f64,
    ) -> Result<Trade> {
        let closed = {
            let mut rows = self.rows.write();
            let trade = rows
                .get_mut(id)
                .with_context(|| format!("trade {id} not found in ledger"))?;

            if trade.status.is_terminal() {
                bail!(
                    "trade {id} already terminal ({}) — refusing second close",
                    trade.status
                );
            }

            trade.status = TradeStatus::Closed(reason);
            trade.close_price = Some(close_price);
            trade.pnl = Some(pnl);
            trade.closed_at = Some(Utc::now().to_rfc3339());
            trade.clone()
        };

        info!(
            id,
            symbol = %closed.symbol,
            status = %closed.status,
            close_price,
            pnl,
            "trade closed"
        );

        self.flush()?;
        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    /// Flush the row map to disk with an atomic tmp + rename, when a backing
    /// path is configured.
    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = {
            let rows = self.rows.read();
            serde_json::to_string_pretty(&*rows).context("failed to serialise ledger rows")?
        };

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp ledger to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp ledger to {}", path.display()))?;

        Ok(())
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.rows.read();
        let active = rows
            .values()
            .filter(|t| t.status == TradeStatus::Active)
            .count();
        f.debug_struct("TradeLedger")
            .field("rows", &rows.len())
            .field("active", &active)
            .finish()
    }
}
