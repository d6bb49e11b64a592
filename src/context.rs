// =============================================================================
// Core Context — process-wide wiring (§9: no singletons, everything via Arc)
// =============================================================================
//
// The teacher already centralizes every subsystem into one `AppState` passed
// around as `Arc<AppState>`; this is the same pattern, regrouped around the
// new domain's component boundaries and with per-account risk/order state
// kept in get-or-create maps instead of one flat global, since DLL/MLL and
// bracket bookkeeping are meaningful per account, not per process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono_tz::Tz;
use parking_lot::RwLock;
use tracing::info;

use crate::account_store::AccountStore;
use crate::broker::{BrokerClient, BrokerStreamClient};
use crate::config::{EngineConfig, RuntimeConfig};
use crate::event_bus::EventBus;
use crate::market_data::{BarAggregator, HistoricalDataService};
use crate::order_manager::OrderManager;
use crate::risk::RiskMonitor;
use crate::scheduler::TaskScheduler;
use crate::store::Store;
use crate::strategy::{StrategyContext, StrategyRuntime};

/// Per-account risk limits, resolved from the account's starting balance and
/// the hot-reloadable default percentages in `RuntimeConfig`, unless the
/// account has an explicit override persisted in `settings` (not yet wired;
/// defaults apply to every account today).
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub dll_limit: f64,
    pub mll_limit: f64,
    pub trail_threshold: f64,
}

/// Everything a request handler, strategy cycle, or background task needs,
/// assembled once at startup and handed out as `Arc<CoreContext>` (§9).
pub struct CoreContext {
    pub config: EngineConfig,
    pub runtime_config: RwLock<RuntimeConfig>,
    pub store: Arc<Store>,
    pub broker: Arc<BrokerClient>,
    pub stream: Arc<BrokerStreamClient>,
    pub accounts: Arc<AccountStore>,
    pub historical: Arc<HistoricalDataService>,
    pub aggregator: Arc<BarAggregator>,
    pub events: Arc<EventBus>,
    pub scheduler: Arc<TaskScheduler>,
    pub strategies: Arc<StrategyRuntime>,
    pub exchange_tz: Tz,

    risk_monitors: RwLock<HashMap<String, Arc<RiskMonitor>>>,
    order_managers: RwLock<HashMap<String, Arc<OrderManager>>>,
}

impl CoreContext {
    pub fn new(config: EngineConfig, runtime_config: RuntimeConfig, store: Arc<Store>) -> Arc<Self> {
        let broker = Arc::new(BrokerClient::new(
            config.broker_base_url.clone(),
            config.broker_username.clone(),
            config.broker_api_key.clone(),
        ));
        let stream_topics = vec![
            "account_update".to_string(),
            "position_update".to_string(),
            "order_update".to_string(),
            "trade_fill".to_string(),
        ];
        let stream = Arc::new(BrokerStreamClient::new(config.broker_base_url.clone(), stream_topics));
        let accounts = Arc::new(AccountStore::new(broker.clone()));
        let historical = Arc::new(HistoricalDataService::new(
            broker.clone(),
            store.clone(),
            config.bar_cache_ttl_rth_secs,
            config.bar_cache_ttl_off_secs,
        ));
        let aggregator = BarAggregator::new();
        let events = EventBus::new();
        let scheduler = Arc::new(TaskScheduler::spawn());
        let exchange_tz: Tz = config.exchange_tz.parse().unwrap_or(chrono_tz::America::Chicago);
        let strategies = Arc::new(StrategyRuntime::new(store.clone(), exchange_tz));

        info!(exchange_tz = %exchange_tz, "core context assembled");

        Arc::new(Self {
            config,
            runtime_config: RwLock::new(runtime_config),
            store,
            broker,
            stream,
            accounts,
            historical,
            aggregator,
            events,
            scheduler,
            strategies,
            exchange_tz,
            risk_monitors: RwLock::new(HashMap::new()),
            order_managers: RwLock::new(HashMap::new()),
        })
    }

    /// Resolves the per-account risk limits from the current `RuntimeConfig`
    /// defaults (§6 Configuration: `default_max_daily_loss_pct`/
    /// `default_max_loss_trail_pct`).
    pub fn risk_limits_for(&self, start_of_day_balance: f64) -> RiskLimits {
        let cfg = self.runtime_config.read();
        RiskLimits {
            dll_limit: start_of_day_balance * cfg.default_max_daily_loss_pct / 100.0,
            mll_limit: start_of_day_balance * cfg.default_max_loss_trail_pct / 100.0,
            trail_threshold: start_of_day_balance * cfg.default_max_loss_trail_pct / 100.0,
        }
    }

    /// Get-or-create the `RiskMonitor` for `account_id`, seeded from
    /// `start_of_day_balance` the first time it's requested.
    pub fn risk_monitor_for(&self, account_id: &str, start_of_day_balance: f64) -> Arc<RiskMonitor> {
        if let Some(monitor) = self.risk_monitors.read().get(account_id) {
            return monitor.clone();
        }
        let limits = self.risk_limits_for(start_of_day_balance);
        let monitor = Arc::new(RiskMonitor::new(
            account_id,
            start_of_day_balance,
            limits.dll_limit,
            limits.mll_limit,
            limits.trail_threshold,
        ));
        self.risk_monitors.write().entry(account_id.to_string()).or_insert(monitor).clone()
    }

    /// Get-or-create the `OrderManager` for `account_id`. Requires the risk
    /// monitor to already exist (call `risk_monitor_for` first on account
    /// discovery).
    pub fn order_manager_for(&self, account_id: &str) -> Option<Arc<OrderManager>> {
        if let Some(mgr) = self.order_managers.read().get(account_id) {
            return Some(mgr.clone());
        }
        let risk = self.risk_monitors.read().get(account_id).cloned()?;
        let mgr = Arc::new(OrderManager::new(
            self.broker.clone(),
            self.accounts.clone(),
            risk,
            self.store.clone(),
            self.events.clone(),
            self.strategies.clone(),
            self.config.risk_auto_flatten_on_violation,
        ));
        Some(self.order_managers.write().entry(account_id.to_string()).or_insert(mgr).clone())
    }

    /// Builds the `StrategyContext` for one account's scheduled cycle.
    /// Passed as the `ctx_for` closure to `StrategyRuntime::tick`.
    pub fn strategy_context_for(&self, account_id: &str) -> StrategyContext {
        let orders = self
            .order_manager_for(account_id)
            .unwrap_or_else(|| panic!("order manager requested for unknown account {account_id}"));
        let risk = self.risk_monitors.read().get(account_id).cloned().expect("risk monitor must precede order manager");
        StrategyContext {
            account_id: account_id.to_string(),
            broker: self.broker.clone(),
            historical: self.historical.clone(),
            accounts: self.accounts.clone(),
            orders,
            risk,
            store: self.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Arc<CoreContext> {
        let mut config = EngineConfig::from_env();
        config.database_url = ":memory:".to_string();
        let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
        CoreContext::new(config, RuntimeConfig::default(), store)
    }

    #[test]
    fn risk_monitor_for_is_memoized_per_account() {
        let ctx = test_context();
        let a = ctx.risk_monitor_for("A1", 50_000.0);
        let b = ctx.risk_monitor_for("A1", 999_999.0);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn order_manager_for_requires_risk_monitor_first() {
        let ctx = test_context();
        assert!(ctx.order_manager_for("A2").is_none());
        ctx.risk_monitor_for("A2", 50_000.0);
        assert!(ctx.order_manager_for("A2").is_some());
    }

    #[test]
    fn risk_limits_scale_with_runtime_config_percentages() {
        let ctx = test_context();
        let limits = ctx.risk_limits_for(100_000.0);
        assert!((limits.dll_limit - 3_000.0).abs() < 1e-9);
        assert!((limits.mll_limit - 6_000.0).abs() < 1e-9);
    }
}
