// =============================================================================
// Exchange Gateway — the remote-operation seam of the guardian
// =============================================================================
//
// Everything the lifecycle engine needs from the exchange goes through the
// `ExchangeApi` trait: fetching prices/candles/balances, cancelling orders,
// and placing the market sell that liquidates a position.  All remote calls
// are fallible and latent; callers treat them as at-least-once-safe to retry
// EXCEPT order placement, which must be preceded by a fresh cancel +
// settlement check (see guardian::closure).
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::BinanceClient;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{BalanceInfo, Candle};

/// Remote exchange operations consumed by the trade lifecycle engine.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Fetch OHLCV candles, oldest first.
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Last traded price for `symbol`.
    async fn ticker_price(&self, symbol: &str) -> Result<f64>;

    /// Full account balance snapshot (non-zero assets only).
    async fn account_balances(&self) -> Result<Vec<BalanceInfo>>;

    /// Free (unlocked) balance of a single asset.
    async fn free_balance(&self, asset: &str) -> Result<f64>;

    /// Cancel every open order on `symbol`.  Idempotent — safe to repeat.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Place a market sell for `quantity` and return the achieved fill price.
    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<f64>;

    /// Round `quantity` down to the symbol's tradable precision.
    fn amount_to_precision(&self, symbol: &str, quantity: f64) -> f64;
}
