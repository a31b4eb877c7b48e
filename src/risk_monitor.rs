// =============================================================================
// Portfolio Risk Monitor — concentration surveillance
// =============================================================================
//
// Periodically values the full account in quote terms and checks two
// concentration limits:
//
//   per asset    value / total > max_asset_pct   (only assets above the
//                min_asset_value noise floor)
//   per sector   sum of a sector's values / total > max_sector_pct, using a
//                static asset -> sector classification
//
// Strictly advisory: the monitor never touches a trade row.  Portfolios
// below `min_portfolio_value` are skipped silently.  The analysis itself is
// a pure function over the valuation snapshot, so the limit logic is
// testable without any IO.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::runtime_config::GuardianConfig;

/// One asset's quote-denominated valuation.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetValuation {
    pub asset: String,
    pub value: f64,
}

/// A limit breach found by the analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationAlert {
    /// Asset symbol or sector name.
    pub subject: String,
    pub pct: f64,
    pub limit: f64,
}

/// Outcome of one concentration analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcentrationReport {
    pub total_value: f64,
    /// Portfolio below the minimum — nothing was checked.
    pub skipped: bool,
    pub asset_alerts: Vec<ConcentrationAlert>,
    pub sector_alerts: Vec<ConcentrationAlert>,
}

impl ConcentrationReport {
    pub fn is_clean(&self) -> bool {
        self.asset_alerts.is_empty() && self.sector_alerts.is_empty()
    }
}

/// Static sector classification.  Unlisted assets fall into "other".
pub fn sector_of(asset: &str) -> &'static str {
    match asset {
        "BTC" => "store_of_value",
        "ETH" | "SOL" | "ADA" | "AVAX" | "DOT" | "NEAR" | "ATOM" => "smart_contract",
        "USDT" | "USDC" | "DAI" | "FDUSD" => "stablecoin",
        "UNI" | "AAVE" | "CRV" | "LINK" | "MKR" => "defi",
        "DOGE" | "SHIB" | "PEPE" => "meme",
        _ => "other",
    }
}

/// Pure concentration analysis over a valuation snapshot.
pub fn analyze(valuations: &[AssetValuation], config: &GuardianConfig) -> ConcentrationReport {
    let total: f64 = valuations.iter().map(|v| v.value).sum();

    if total < config.min_portfolio_value {
        return ConcentrationReport {
            total_value: total,
            skipped: true,
            ..Default::default()
        };
    }

    let mut report = ConcentrationReport {
        total_value: total,
        ..Default::default()
    };

    let mut sectors: BTreeMap<&'static str, f64> = BTreeMap::new();

    for valuation in valuations {
        *sectors.entry(sector_of(&valuation.asset)).or_default() += valuation.value;

        if valuation.value < config.min_asset_value {
            continue;
        }
        let pct = valuation.value / total * 100.0;
        if pct > config.max_asset_pct {
            report.asset_alerts.push(ConcentrationAlert {
                subject: valuation.asset.clone(),
                pct,
                limit: config.max_asset_pct,
            });
        }
    }

    for (sector, value) in sectors {
        let pct = value / total * 100.0;
        if pct > config.max_sector_pct {
            report.sector_alerts.push(ConcentrationAlert {
                subject: sector.to_string(),
                pct,
                limit: config.max_sector_pct,
            });
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Periodic job
// ---------------------------------------------------------------------------

/// Periodic risk-monitor loop.
pub async fn run_risk_monitor(state: Arc<AppState>) {
    let period = state.config_snapshot().risk_monitor_interval_secs;
    let mut ticker = interval(Duration::from_secs(period.max(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = check_concentration(&state).await {
            warn!(error = %e, "concentration check failed");
        }
    }
}

/// Value the account and report concentration breaches.
pub async fn check_concentration(state: &Arc<AppState>) -> Result<()> {
    let config = state.config_snapshot();
    let balances = state.exchange.account_balances().await?;

    let mut valuations = Vec::with_capacity(balances.len());
    for balance in balances {
        let value = if balance.asset == config.quote_asset {
            balance.total()
        } else {
            let symbol = format!("{}{}", balance.asset, config.quote_asset);
            match state.exchange.ticker_price(&symbol).await {
                Ok(price) => balance.total() * price,
                Err(e) => {
                    // A single unpriceable asset must not sink the whole pass.
                    debug!(asset = %balance.asset, error = %e, "skipping unpriceable asset");
                    continue;
                }
            }
        };
        valuations.push(AssetValuation {
            asset: balance.asset,
            value,
        });
    }

    let report = analyze(&valuations, &config);

    if report.skipped {
        debug!(
            total = report.total_value,
            minimum = config.min_portfolio_value,
            "portfolio below minimum — concentration check skipped"
        );
        return Ok(());
    }

    info!(
        total = report.total_value,
        asset_alerts = report.asset_alerts.len(),
        sector_alerts = report.sector_alerts.len(),
        "concentration check done"
    );

    for alert in &report.asset_alerts {
        state
            .notifier
            .send(&format!(
                "⚖️ concentration: {} is {:.1}% of the portfolio (limit {:.0}%)",
                alert.subject, alert.pct, alert.limit
            ))
            .await;
    }
    for alert in &report.sector_alerts {
        state
            .notifier
            .send(&format!(
                "⚖️ sector concentration: {} holds {:.1}% of the portfolio (limit {:.0}%)",
                alert.subject, alert.pct, alert.limit
            ))
            .await;
    }

    Ok(())
}
