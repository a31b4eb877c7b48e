// =============================================================================
// Average Directional Index (ADX) — trend strength regardless of direction
// =============================================================================
//
// Pipeline: per-bar +DM / -DM / TR -> Wilder's smoothing -> +DI / -DI ->
// DX = |+DI - -DI| / (+DI + -DI) * 100 -> ADX = smoothed DX average.
//
// Interpretation: ADX > 25 trending, ADX < 20 ranging/choppy.
// =============================================================================

use crate::types::Candle;

/// Compute the most recent ADX value from OHLCV candles (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than
/// `2 * period + 1` candles (`period` bars for the initial smoothing plus
/// `period` DX values to seed the average), or any intermediate value is
/// non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let n = candles.len();
    let bar_count = n - 1;

    // Raw +DM, -DM, and True Range per bar-to-bar transition.
    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    // Wilder's smoothing, seeded with plain sums over the first window.
    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(bar_count - period + 1);
    dx_values.push(compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr)?);

    for i in period..bar_count {
        smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[i];
        smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        dx_values.push(compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: Wilder's smoothed average of DX, seeded with the first window's SMA.
    let seed: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut adx = seed;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            return None;
        }
    }

    adx.is_finite().then_some(adx)
}

/// DX from smoothed +DM, -DM, and TR.  `None` when TR is zero or the result
/// is non-finite; zero directional movement yields `Some(0.0)`.
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    dx.is_finite().then_some(dx)
}
