// =============================================================================
// Shared types used across the Sentinel trade guardian
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle as returned by the exchange klines endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time,
        }
    }

    /// Extract the closing prices from a candle slice (oldest first).
    pub fn closes(candles: &[Candle]) -> Vec<f64> {
        candles.iter().map(|c| c.close).collect()
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

impl BalanceInfo {
    /// Total holding (free + locked) for this asset.
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}
