// =============================================================================
// Trade Guardian — tick-driven exit engine
// =============================================================================
//
// The guardian owns the exit side of every position.  Each live price tick is
// evaluated against the trade row in strict priority order (stop-loss, scalp,
// take-profit, trailing management, profit notification); the first closing
// decision wins and hands the trade to the hardened closure protocol.
// =============================================================================

pub mod closure;
mod tick;

pub use tick::on_price_tick;
