// =============================================================================
// Strategy Runtime — registry, lifecycle, scheduling (§4.J)
// =============================================================================
//
// Grounded on the teacher's `StrategyEngine` (the "gather data -> compute ->
// gate -> emit proposal" pipeline shape of `evaluate_symbol`) generalized
// from a single hard-coded ensemble strategy into a registry of pluggable
// `Strategy` implementations, with lifecycle/scheduling state the teacher
// didn't need (its strategy ran unconditionally on every candle close)
// modeled on `exit/monitor.rs`'s periodic-tick-then-transition shape.

pub mod overnight_range;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::account_store::AccountStore;
use crate::broker::BrokerClient;
use crate::domain::{Bar, StrategyConfig, StrategyKind, StrategyState, StrategyStatus};
use crate::error::EngineError;
use crate::market_data::HistoricalDataService;
use crate::order_manager::OrderManager;
use crate::risk::RiskMonitor;
use crate::store::Store;

/// Single retry delay after a strategy cycle errors, before dropping to
/// `STOPPED` (§4.J).
const ERROR_RETRY_DELAY: ChronoDuration = ChronoDuration::seconds(60);

/// Shared handles a strategy's `execute_cycle` needs; assembled once by
/// `CoreContext` and passed through on every cycle.
pub struct StrategyContext {
    pub account_id: String,
    pub broker: Arc<BrokerClient>,
    pub historical: Arc<HistoricalDataService>,
    pub accounts: Arc<AccountStore>,
    pub orders: Arc<OrderManager>,
    pub risk: Arc<RiskMonitor>,
    pub store: Arc<Store>,
}

/// Capability surface every registered strategy kind implements (§4.J:
/// `{analyze, executeCycle, onFill, onBar}`). `on_fill`/`on_bar` default to
/// no-ops since not every strategy reacts to every event.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Runs once per scheduled execution window.
    async fn execute_cycle(&self, ctx: &StrategyContext, config: &StrategyConfig) -> Result<(), EngineError>;

    fn on_fill(&self, _ctx: &StrategyContext, _order_id: &str) {}

    fn on_bar(&self, _ctx: &StrategyContext, _bar: &Bar) {}

    /// Next scheduled execution instant after `now`, given the strategy's
    /// own parameters and the exchange timezone. `OvernightRange` schedules
    /// off `market_open_time`; other kinds may override.
    fn next_execution_after(&self, config: &StrategyConfig, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

struct StrategySlot {
    strategy: Arc<dyn Strategy>,
    config: StrategyConfig,
    state: StrategyState,
    error_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SlotKey {
    account_id: String,
    kind: StrategyKind,
}

/// Registry of `(strategy, account)` lifecycle slots (§4.J). `enabled=true`
/// configs persisted in the store are auto-enabled on `load_persisted`.
pub struct StrategyRuntime {
    /// Registered implementations, one per `StrategyKind`, shared across
    /// every account that enables it.
    implementations: RwLock<Vec<Arc<dyn Strategy>>>,
    slots: RwLock<HashMap<SlotKey, StrategySlot>>,
    store: Arc<Store>,
    exchange_tz: Tz,
}

impl StrategyRuntime {
    pub fn new(store: Arc<Store>, exchange_tz: Tz) -> Self {
        Self { implementations: RwLock::new(Vec::new()), slots: RwLock::new(HashMap::new()), store, exchange_tz }
    }

    pub fn register(&self, strategy: Arc<dyn Strategy>) {
        info!(kind = %strategy.kind(), "strategy implementation registered");
        self.implementations.write().push(strategy);
    }

    fn find_strategy(&self, kind: StrategyKind) -> Option<Arc<dyn Strategy>> {
        self.implementations.read().iter().find(|s| s.kind() == kind).cloned()
    }

    /// Loads every persisted `StrategyConfig` and auto-enables those with
    /// `enabled=true` (§4.J persistence contract, §8 invariant 7).
    pub fn load_persisted(&self) -> Result<(), EngineError> {
        let configs = self.store.load_all_strategy_configs().map_err(|e| EngineError::Internal(e.to_string()))?;
        let now = Utc::now();
        for config in configs {
            if config.enabled {
                self.enable(config, now)?;
            }
        }
        Ok(())
    }

    /// Atomic replace of a strategy's config; deferred if the slot is
    /// currently `RUNNING` (§4.J config update contract).
    pub fn update_config(&self, account_id: &str, kind: StrategyKind, config: StrategyConfig) -> Result<(), EngineError> {
        self.store.save_strategy_config(&config).map_err(|e| EngineError::Internal(e.to_string()))?;

        let key = SlotKey { account_id: account_id.to_string(), kind };
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(&key) {
            if slot.state.status == StrategyStatus::Running {
                info!(account_id, %kind, "config update deferred until running cycle ends");
            } else {
                slot.config = config;
            }
        }
        Ok(())
    }

    pub fn enable(&self, config: StrategyConfig, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(strategy) = self.find_strategy(config.name) else {
            return Err(EngineError::Internal(format!("no implementation registered for {}", config.name)));
        };
        let next = strategy.next_execution_after(&config, self.exchange_tz, now);

        let key = SlotKey { account_id: config.account_id.clone(), kind: config.name };
        let mut state = StrategyState::default();
        state.status = StrategyStatus::EnabledIdle;
        state.next_execution_at = next;

        self.slots.write().insert(key, StrategySlot { strategy, config, state, error_retry_at: None });
        Ok(())
    }

    pub fn disable(&self, account_id: &str, kind: StrategyKind) {
        let key = SlotKey { account_id: account_id.to_string(), kind };
        if let Some(slot) = self.slots.write().get_mut(&key) {
            slot.state.status = StrategyStatus::Disabled;
            slot.state.next_execution_at = None;
        }
    }

    /// Disables every strategy slot for `account_id`, regardless of kind.
    /// Used by the risk monitor's non-compliance handler (§4.H), which must
    /// stop all trading on the account rather than one strategy at a time.
    pub fn disable_all(&self, account_id: &str) {
        let mut slots = self.slots.write();
        for (key, slot) in slots.iter_mut() {
            if key.account_id == account_id {
                slot.state.status = StrategyStatus::Disabled;
                slot.state.next_execution_at = None;
            }
        }
    }

    /// Drives every slot through one scheduling tick: slots whose window has
    /// opened run `execute_cycle` exactly once, then reschedule (§4.J).
    pub async fn tick(&self, ctx_for: impl Fn(&str) -> StrategyContext) {
        let now = Utc::now();
        let due: Vec<SlotKey> = {
            let slots = self.slots.read();
            slots
                .iter()
                .filter(|(_, slot)| self.is_due(slot, now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        for key in due {
            self.run_one(&key, ctx_for(&key.account_id)).await;
        }
    }

    fn is_due(&self, slot: &StrategySlot, now: DateTime<Utc>) -> bool {
        match slot.state.status {
            StrategyStatus::EnabledIdle => slot.state.next_execution_at.is_some_and(|t| now >= t),
            StrategyStatus::Error => slot.error_retry_at.is_some_and(|t| now >= t),
            _ => false,
        }
    }

    async fn run_one(&self, key: &SlotKey, ctx: StrategyContext) {
        let (strategy, config) = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(key) else { return };
            slot.state.status = StrategyStatus::Running;
            slot.state.last_tick = Some(Utc::now());
            (slot.strategy.clone(), slot.config.clone())
        };

        let result = strategy.execute_cycle(&ctx, &config).await;
        let now = Utc::now();

        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(key) else { return };
        match result {
            Ok(()) => {
                slot.state.status = StrategyStatus::EnabledIdle;
                slot.state.next_execution_at = strategy.next_execution_after(&slot.config, self.exchange_tz, now);
                slot.error_retry_at = None;
            }
            Err(err) => {
                error!(account_id = %key.account_id, kind = %key.kind, error = %err, "strategy cycle failed");
                if slot.error_retry_at.is_none() {
                    slot.state.status = StrategyStatus::Error;
                    slot.error_retry_at = Some(now + ERROR_RETRY_DELAY);
                } else {
                    warn!(account_id = %key.account_id, kind = %key.kind, "strategy dropping to STOPPED after retry failure");
                    slot.state.status = StrategyStatus::Stopped;
                    slot.error_retry_at = None;
                }
            }
        }
    }

    pub fn snapshot(&self, account_id: &str, kind: StrategyKind) -> Option<StrategyState> {
        let key = SlotKey { account_id: account_id.to_string(), kind };
        self.slots.read().get(&key).map(|s| s.state.clone())
    }
}

/// Resolves `config.market_open_time` (an `"HH:MM"` string in `tz`) to the
/// next absolute instant after `now`, recurring daily.
pub fn next_daily_occurrence(hhmm: &str, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (hour, minute) = parse_hhmm(hhmm)?;
    let local_now = now.with_timezone(&tz);
    let today = tz
        .with_ymd_and_hms(local_now.year(), local_now.month(), local_now.day(), hour, minute, 0)
        .single()?;
    let candidate = if today > local_now { today } else { today + ChronoDuration::days(1) };
    Some(candidate.with_timezone(&Utc))
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_hhmm() {
        assert_eq!(parse_hhmm("08:30"), Some((8, 30)));
        assert_eq!(parse_hhmm("not-a-time"), None);
    }

    #[test]
    fn next_daily_occurrence_rolls_to_tomorrow_if_passed() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 23, 0, 0).unwrap();
        let next = next_daily_occurrence("08:30", tz, now).unwrap();
        assert_eq!(next.with_timezone(&tz).day(), 16);
    }

    #[test]
    fn next_daily_occurrence_stays_today_if_upcoming() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap();
        let next = next_daily_occurrence("08:30", tz, now).unwrap();
        assert_eq!(next.with_timezone(&tz).day(), 15);
    }
}
