// =============================================================================
// Binance REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized.  All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the guardian and the exchange.
//
// The lot-size (step) filters needed by `amount_to_precision` are fetched
// once per symbol via `load_symbol_filters` and cached; quantities are always
// floored, never rounded up, so a sell can never exceed the held balance.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::RateLimitTracker;
use crate::exchange::ExchangeApi;
use crate::types::{BalanceInfo, Candle};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Step size assumed for symbols whose filters have not been loaded.
const FALLBACK_STEP: f64 = 1e-6;

/// Binance REST client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: RateLimitTracker,
    /// Lot-size step per symbol, loaded from exchangeInfo.
    step_sizes: RwLock<HashMap<String, f64>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.  `api_key` is sent as a header on every request;
    /// `secret` is used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Self {
            secret: secret.into(),
            base_url: "https://api.binance.com".to_string(),
            client,
            rate_limits: RateLimitTracker::new(),
            step_sizes: RwLock::new(HashMap::new()),
        }
    }

    /// Rate-limit tracker, exposed so the bootstrap can run the periodic
    /// 10 s order-counter reset.
    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Send a signed request to `endpoint` and parse the JSON body, feeding
    /// the rate-limit tracker from the response headers.
    async fn send_signed(
        &self,
        method: Method,
        endpoint: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        anyhow::ensure!(
            self.rate_limits.can_send_request(1),
            "request weight budget exhausted for {endpoint}"
        );

        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, endpoint, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {endpoint} request failed"))?;

        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {method} {endpoint} returned {status}: {body}");
        }

        Ok(body)
    }

    /// Send a public (unsigned) GET and parse the JSON body.
    async fn send_public(&self, endpoint: &str, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {endpoint} request failed"))?;

        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {endpoint} returned {status}: {body}");
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Symbol filters
    // -------------------------------------------------------------------------

    /// Fetch the LOT_SIZE step for `symbol` from exchangeInfo and cache it.
    #[instrument(skip(self), name = "binance::load_symbol_filters")]
    pub async fn load_symbol_filters(&self, symbol: &str) -> Result<()> {
        let body = self
            .send_public("/api/v3/exchangeInfo", &format!("symbol={symbol}"))
            .await?;

        let filters = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|s| s["filters"].as_array())
            .context("exchangeInfo response missing symbol filters")?;

        for filter in filters {
            if filter["filterType"].as_str() == Some("LOT_SIZE") {
                let step: f64 = filter["stepSize"]
                    .as_str()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0.0);
                if step > 0.0 {
                    self.step_sizes.write().insert(symbol.to_string(), step);
                    debug!(symbol, step, "lot-size filter cached");
                    return Ok(());
                }
            }
        }

        warn!(symbol, "no LOT_SIZE filter found — using fallback step");
        Ok(())
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

// =============================================================================
// ExchangeApi implementation
// =============================================================================

#[async_trait]
impl ExchangeApi for BinanceClient {
    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::fetch_klines")]
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let body = self
            .send_public(
                "/api/v3/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;

        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                Self::parse_str_f64(&arr[1])?,
                Self::parse_str_f64(&arr[2])?,
                Self::parse_str_f64(&arr[3])?,
                Self::parse_str_f64(&arr[4])?,
                Self::parse_str_f64(&arr[5])?,
                arr[6].as_i64().unwrap_or(0),
            ));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/price (public).
    #[instrument(skip(self), name = "binance::ticker_price")]
    async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .send_public("/api/v3/ticker/price", &format!("symbol={symbol}"))
            .await?;
        let price = Self::parse_str_f64(&body["price"])
            .with_context(|| format!("ticker response for {symbol} missing price"))?;
        debug!(symbol, price, "ticker price fetched");
        Ok(price)
    }

    /// GET /api/v3/account (signed) — non-zero balances only.
    #[instrument(skip(self), name = "binance::account_balances")]
    async fn account_balances(&self) -> Result<Vec<BalanceInfo>> {
        let account = self.send_signed(Method::GET, "/api/v3/account", "").await?;

        let raw = account["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        let mut balances = Vec::new();
        for b in raw {
            let asset = b["asset"].as_str().unwrap_or("").to_string();
            let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            let locked: f64 = b["locked"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            if free > 0.0 || locked > 0.0 {
                balances.push(BalanceInfo { asset, free, locked });
            }
        }

        debug!(count = balances.len(), "account balances retrieved");
        Ok(balances)
    }

    /// Free balance of a single asset; an unknown asset reads as zero.
    #[instrument(skip(self), name = "binance::free_balance")]
    async fn free_balance(&self, asset: &str) -> Result<f64> {
        let balances = self.account_balances().await?;
        let free = balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(0.0);
        debug!(asset, free, "free balance retrieved");
        Ok(free)
    }

    /// DELETE /api/v3/openOrders (signed).  Binance rejects the call with
    /// code -2011 when there is nothing to cancel; that counts as success.
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        match self
            .send_signed(
                Method::DELETE,
                "/api/v3/openOrders",
                &format!("symbol={symbol}"),
            )
            .await
        {
            Ok(_) => {
                debug!(symbol, "open orders cancelled");
                Ok(())
            }
            Err(e) if e.to_string().contains("-2011") => {
                debug!(symbol, "no open orders to cancel");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// POST /api/v3/order (signed) — market sell, full response so the fill
    /// price can be derived from cummulativeQuoteQty / executedQty.
    #[instrument(skip(self), name = "binance::market_sell")]
    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<f64> {
        anyhow::ensure!(
            self.rate_limits.can_place_order(),
            "order rate limit reached — refusing market sell on {symbol}"
        );

        let params = format!(
            "symbol={symbol}&side=SELL&type=MARKET&quantity={quantity}&newOrderRespType=FULL"
        );

        self.rate_limits.record_order_sent();
        let body = self.send_signed(Method::POST, "/api/v3/order", &params).await?;

        let executed = Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0);
        let quote = Self::parse_str_f64(&body["cummulativeQuoteQty"]).unwrap_or(0.0);

        let fill_price = if executed > 0.0 && quote > 0.0 {
            quote / executed
        } else {
            // Fall back to the last traded price if the response carried no
            // fill economics.
            warn!(symbol, "market sell response missing fills — using ticker price");
            self.ticker_price(symbol).await?
        };

        debug!(symbol, quantity, fill_price, "market sell executed");
        Ok(fill_price)
    }

    /// Floor `quantity` to the cached lot-size step for `symbol`.
    fn amount_to_precision(&self, symbol: &str, quantity: f64) -> f64 {
        let step = self
            .step_sizes
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(FALLBACK_STEP);
        if step <= 0.0 {
            return quantity;
        }
        (quantity / step).floor() * step
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("rate_limits", &self.rate_limits)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_to_precision_floors_to_step() {
        let client = BinanceClient::new("key", "secret");
        client.step_sizes.write().insert("BTCUSDT".into(), 0.001);

        let adjusted = client.amount_to_precision("BTCUSDT", 0.123456);
        assert!((adjusted - 0.123).abs() < 1e-12);

        // Never rounds up.
        let adjusted = client.amount_to_precision("BTCUSDT", 0.1239);
        assert!((adjusted - 0.123).abs() < 1e-12);
    }

    #[test]
    fn amount_to_precision_unknown_symbol_uses_fallback() {
        let client = BinanceClient::new("key", "secret");
        let adjusted = client.amount_to_precision("ETHUSDT", 1.23456789);
        assert!((adjusted - 1.234567).abs() < 1e-12);
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceClient::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
