// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive than the
// Simple Moving Average:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
// The very first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Simple moving average of the most recent `period` closes.
///
/// Returns `None` when `period` is zero, the input is too short, or the
/// result is non-finite.
pub fn latest_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let sma = closes[closes.len() - period..].iter().sum::<f64>() / period as f64;
    sma.is_finite().then_some(sma)
}

/// Compute the EMA series for the given `closes` and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// A non-finite intermediate value truncates the series — downstream
/// consumers should not trust a broken tail.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Most recent EMA value for the given period.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

/// Check whether the EMA-9 / EMA-21 / EMA-55 stack is trend-aligned.
///
/// Returns `Some((is_bullish, strength))` where `strength` is the normalised
/// spread `|EMA9 - EMA55| / EMA55`.  Returns `None` on insufficient data,
/// mixed (unaligned) ordering, or degenerate values.
pub fn ema_trend_aligned(closes: &[f64]) -> Option<(bool, f64)> {
    if closes.len() < 55 {
        return None;
    }

    let e9 = latest_ema(closes, 9)?;
    let e21 = latest_ema(closes, 21)?;
    let e55 = latest_ema(closes, 55)?;

    let bullish = e9 > e21 && e21 > e55;
    let bearish = e9 < e21 && e21 < e55;
    if !bullish && !bearish {
        return None;
    }

    if e55 == 0.0 {
        return None;
    }
    let strength = (e9 - e55).abs() / e55;
    strength.is_finite().then_some((bullish, strength))
}
