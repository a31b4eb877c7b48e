// =============================================================================
// Rate of Change (ROC) — momentum
// =============================================================================
//
//   ROC = ((close - close_n) / close_n) * 100
//
// Positive ROC indicates upward momentum; negative indicates downward.

/// ROC series for the given closes and look-back, one value per close
/// starting at index `period`.
pub fn calculate_roc(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period);
    for i in period..closes.len() {
        let prev = closes[i - period];
        if prev == 0.0 {
            result.push(0.0);
        } else {
            result.push(((closes[i] - prev) / prev) * 100.0);
        }
    }
    result
}

/// Most recent ROC value.
pub fn current_roc(closes: &[f64], period: usize) -> Option<f64> {
    calculate_roc(closes, period).last().copied()
}
