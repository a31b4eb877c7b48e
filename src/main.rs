// =============================================================================
// Sentinel Trade Guardian — Main Entry Point
// =============================================================================
//
// The guardian only manages the EXIT side of existing spot positions: it
// never opens trades.  Rows appear in the ledger through the external entry
// flow; from then on the guardian watches prices, the supervisor recovers
// stuck closures, the advisor adjusts targets, the reviewer re-validates
// entry signals, and the risk monitor watches portfolio concentration.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisor;
mod app_state;
mod exchange;
mod guardian;
mod indicators;
mod journal;
mod ledger;
mod notifier;
mod reviewer;
mod risk_monitor;
mod runtime_config;
mod subscriptions;
mod supervisor;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::exchange::{BinanceClient, ExchangeApi};
use crate::journal::TradeJournal;
use crate::ledger::TradeLedger;
use crate::notifier::Notifier;
use crate::runtime_config::GuardianConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Sentinel Trade Guardian — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("GUARDIAN_CONFIG").unwrap_or_else(|_| "guardian_config.json".into());

    let mut config = GuardianConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        GuardianConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("GUARDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(v) = std::env::var("SCALP_MODE") {
        config.scalp_mode = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = std::env::var("AUTO_CLOSE_ON_WEAKNESS") {
        config.auto_close_on_weakness = v == "1" || v.eq_ignore_ascii_case("true");
    }

    info!(
        symbols = ?config.symbols,
        scalp_mode = config.scalp_mode,
        auto_close_on_weakness = config.auto_close_on_weakness,
        "Guardian configured"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set — signed calls will fail");
    }
    let client = Arc::new(BinanceClient::new(api_key, api_secret));

    for symbol in &config.symbols {
        if let Err(e) = client.load_symbol_filters(symbol).await {
            warn!(symbol, error = %e, "Failed to load lot-size filters — using fallback step");
        }
    }

    // Order-counter housekeeping: the 10 s window decays locally between
    // exchange responses.
    let limits_client = client.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            limits_client.rate_limits().reset_10s_counter();
        }
    });

    // ── 3. Durable stores & shared state ─────────────────────────────────
    let ledger_path = std::env::var("LEDGER_PATH").unwrap_or_else(|_| "trade_ledger.json".into());
    let ledger = Arc::new(TradeLedger::open(&ledger_path)?);

    let journal_path =
        std::env::var("JOURNAL_PATH").unwrap_or_else(|_| "trade_journal.jsonl".into());
    let journal = Arc::new(TradeJournal::new(&journal_path));

    let notifier = Arc::new(Notifier::from_env());

    let state = Arc::new(AppState::new(
        config,
        ledger,
        client.clone() as Arc<dyn ExchangeApi>,
        notifier,
        journal,
    ));

    reviewer::register_builtin_checks(&state.signal_registry);
    state.subscriptions.resync(&state.ledger);

    // ── 4. Price-poll loop driving guardian ticks ────────────────────────
    let tick_state = state.clone();
    tokio::spawn(async move {
        let period = tick_state.config_snapshot().price_poll_secs;
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(period.max(1)));
        loop {
            interval.tick().await;

            for symbol in tick_state.subscriptions.snapshot() {
                match tick_state.exchange.ticker_price(&symbol).await {
                    Ok(price) => {
                        if let Err(e) =
                            guardian::on_price_tick(&tick_state, &symbol, price).await
                        {
                            error!(symbol, error = %e, "tick handling failed");
                        }
                    }
                    Err(e) => warn!(symbol, error = %e, "price poll failed"),
                }
            }
        }
    });

    // ── 5. Periodic jobs ─────────────────────────────────────────────────
    tokio::spawn(supervisor::run_supervisor(state.clone()));
    tokio::spawn(advisor::run_advisor(state.clone()));
    tokio::spawn(reviewer::run_reviewer(state.clone()));
    tokio::spawn(risk_monitor::run_risk_monitor(state.clone()));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "Failed to save guardian config on shutdown");
    }

    info!("Sentinel Trade Guardian shut down complete.");
    Ok(())
}
