// =============================================================================
// Autonomous Futures Trading Engine — Main Entry Point
// =============================================================================
//
// Grounded on the teacher's `main.rs`: `.env` + `tracing_subscriber` init,
// `RuntimeConfig::load`, one `tokio::spawn` per background concern, an Axum
// server task, and a `ctrl_c`-triggered graceful shutdown that persists
// runtime config on the way out. The teacher's concerns (market data
// streams, strategy loop, exit monitor, reconciliation, regime detection)
// are replaced one-for-one with this engine's: broker stream ingestion,
// the strategy scheduler tick, EOD flatten, and account reconciliation.

mod account_store;
mod api;
mod broker;
mod config;
mod context;
mod domain;
mod error;
mod event_bus;
mod market_data;
mod order_manager;
mod risk;
mod scheduler;
mod store;
mod strategy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::context::CoreContext;
use crate::config::{EngineConfig, RuntimeConfig};
use crate::event_bus::{Event, Topic};
use crate::store::Store;
use crate::strategy::overnight_range::OvernightRangeBreakout;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Futures Trading Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let engine_config = EngineConfig::from_env();
    let runtime_config = RuntimeConfig::load_or_default(RUNTIME_CONFIG_PATH);

    let store = Arc::new(Store::open(&engine_config.database_url)?);
    let ctx = CoreContext::new(engine_config, runtime_config, store);

    ctx.strategies.register(Arc::new(OvernightRangeBreakout::new()));
    if let Err(e) = ctx.strategies.load_persisted() {
        warn!(error = %e, "failed to load persisted strategy configs");
    }

    spawn_broker_stream(ctx.clone());
    spawn_fill_watcher(ctx.clone());
    spawn_reconciliation_loop(ctx.clone());
    spawn_risk_ticker(ctx.clone());
    spawn_strategy_tick_loop(ctx.clone());
    spawn_eod_flatten_loop(ctx.clone());

    let bind_addr = ctx.config.http_listen_addr.clone();
    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        let app = api::rest::router(server_ctx);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = ctx.runtime_config.read().save(RUNTIME_CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Engine shut down complete.");
    Ok(())
}

/// Runs the broker streaming hub client forever, reconnecting internally
/// with its own capped backoff (§4.D). Only a shutdown watch channel stops
/// it; this process never restarts the client from scratch.
fn spawn_broker_stream(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let (_tx, rx) = watch::channel(false);
        ctx.stream.run(rx).await;
    });
}

/// Bridges `BrokerStreamClient` fill events into `OrderManager::on_fill` and
/// the `EventBus`'s `trade_fill`/`order_update` topics, generalizing the
/// teacher's direct position-manager mutation in the strategy loop into an
/// explicit event consumer (§4.D, §4.L).
fn spawn_fill_watcher(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let mut events = ctx.stream.subscribe_events();
        loop {
            match events.recv().await {
                Ok(hub_event) => {
                    if hub_event.topic != "trade_fill" && hub_event.topic != "order_update" {
                        continue;
                    }
                    let account_id = hub_event
                        .payload
                        .get("account_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if account_id.is_empty() {
                        continue;
                    }
                    if hub_event.topic == "trade_fill" {
                        match serde_json::from_value(hub_event.payload.clone()) {
                            Ok(fill) => {
                                if let Some(orders) = ctx.order_manager_for(&account_id) {
                                    if let Err(e) = orders.on_fill(fill).await {
                                        warn!(account_id, error = %e, "on_fill failed");
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to decode trade_fill payload"),
                        }
                    } else if let Ok(order) = serde_json::from_value::<crate::domain::Order>(hub_event.payload.clone()) {
                        ctx.events.publish(Topic::OrderUpdate, Event::Order(order));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "fill watcher lagged on hub events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Periodic per-account REST reconciliation (§4.G: "never auto-cancel",
/// drift detection only). Replaces the teacher's Binance-balance-only
/// `get_account` poll with the full position/order projection refresh.
fn spawn_reconciliation_loop(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let accounts = match ctx.broker.list_accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "reconciliation: failed to list accounts");
                    continue;
                }
            };
            for account in accounts {
                let risk = ctx.risk_monitor_for(&account.id, account.start_of_day_balance);
                match ctx.accounts.reconcile(&account.id).await {
                    Ok(summary) if summary.positions_diverged > 0 || summary.orders_diverged > 0 || summary.balance_diverged => {
                        warn!(account_id = %account.id, ?summary, "reconciliation found drift");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(account_id = %account.id, error = %e, "reconciliation failed"),
                }
                if risk.on_balance_update(account.balance) {
                    if let Some(orders) = ctx.order_manager_for(&account.id) {
                        orders.handle_risk_violation(&account.id).await;
                    }
                }
                ctx.events.publish(Topic::AccountUpdate, Event::Account(account));
            }
        }
    });
}

/// Recomputes risk compliance every 15s folding in live unrealized PnL
/// (§4.H: "recomputed on every fill, every balance update, and on a 15s
/// timer"), since open-position PnL otherwise only updates on the next fill
/// or reconciliation pass.
fn spawn_risk_ticker(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            let accounts = match ctx.broker.list_accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "risk ticker: failed to list accounts");
                    continue;
                }
            };
            for account in accounts {
                let risk = ctx.risk_monitor_for(&account.id, account.start_of_day_balance);
                let unrealized: f64 = ctx.accounts.snapshot(&account.id).positions.iter().map(|p| p.unrealized_pnl).sum();
                if risk.on_tick(unrealized) {
                    if let Some(orders) = ctx.order_manager_for(&account.id) {
                        orders.handle_risk_violation(&account.id).await;
                    }
                }
            }
        }
    });
}

/// Drives `StrategyRuntime::tick` once per second; the runtime itself only
/// actually runs a strategy's cycle when that slot's scheduled window has
/// opened (§4.J).
fn spawn_strategy_tick_loop(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let ctx_for_tick = ctx.clone();
            ctx.strategies.tick(move |account_id| ctx_for_tick.strategy_context_for(account_id)).await;
        }
    });
}

/// Flattens every account at `eod_flatten_local_time` in `exchange_tz`,
/// firing at most once per exchange-local day (§4.I EOD flatten contract).
fn spawn_eod_flatten_loop(ctx: Arc<CoreContext>) {
    tokio::spawn(async move {
        let mut last_fired_day: Option<i64> = None;
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let Some((hour, minute)) = parse_hhmm(&ctx.config.eod_flatten_local_time) else { continue };
            let now_local = Utc::now().with_timezone(&ctx.exchange_tz);
            if now_local.hour() != hour || now_local.minute() != minute {
                continue;
            }
            let today_ordinal = now_local.num_days_from_ce() as i64;
            if last_fired_day == Some(today_ordinal) {
                continue;
            }
            last_fired_day = Some(today_ordinal);

            let accounts = match ctx.broker.list_accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "EOD flatten: failed to list accounts");
                    continue;
                }
            };
            for account in accounts {
                let Some(orders) = ctx.order_manager_for(&account.id) else { continue };
                if let Err(e) = orders.flatten_eod(&account.id).await {
                    error!(account_id = %account.id, error = %e, "EOD flatten failed");
                }
            }
        }
    });
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}
