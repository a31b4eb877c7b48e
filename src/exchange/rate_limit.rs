// =============================================================================
// Rate-Limit Tracker — monitors exchange API usage to avoid 429s
// =============================================================================
//
// Binance enforces several limits at once:
//   - Request weight: 1200 per minute (we hard-cap ourselves at 1000).
//   - Order rate:     10 per second and 200 000 per day.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and keeps atomic counters that any task may query lock-free.
// Periodic jobs additionally space out their per-item remote calls; this
// tracker is the backstop, not the only politeness measure.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;
/// Maximum orders per day.
const ORDER_1D_LIMIT: u32 = 200_000;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update internal counters from the HTTP response headers returned by
    /// the exchange.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1D") {
            self.order_count_1d.store(c, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Return `true` if we can afford `weight` more request weight without
    /// exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    /// Return `true` if another order fits inside the 10 s and daily windows.
    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);

        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10 s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }

    /// Manually bump the order counters when placing an order locally, before
    /// the exchange responds with updated headers.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the 10-second order counter (call from a periodic timer).
    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .field("order_count_1d", &self.order_count_1d.load(Ordering::Relaxed))
            .finish()
    }
}
