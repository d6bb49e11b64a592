// =============================================================================
// Order Manager — bracket/OCO composition, breakeven, EOD flatten (§4.I)
// =============================================================================
//
// Grounded on the teacher's `ExecutionEngine` (risk pre-check before every
// broker call, `ExecutionResult`-shaped outcomes) and `exit/monitor.rs` (a
// periodic tick loop driving position-level state transitions, "collect
// then act outside the lock" pattern to avoid holding a lock across an
// await). OCO linking and tick-rounded bracket children are new — the
// teacher's Binance integration had no server-side bracket concept — but
// follow the same "compose simple broker calls" shape as `execute_live`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::account_store::AccountStore;
use crate::broker::{BrokerClient, HubEvent, OrderRequest};
use crate::domain::{
    consolidate_fifo, Contract, Fill, Notification, NotificationLevel, Order, OrderSide, OrderStatus, Position, TimeInForce,
};
use crate::error::EngineError;
use crate::event_bus::{Event, EventBus, Topic};
use crate::risk::{RiskMonitor, TradeIntent};
use crate::store::Store;
use crate::strategy::StrategyRuntime;

#[derive(Debug, Clone, Default)]
pub struct BracketOpts {
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub reduce_only: bool,
    pub idempotency_key: Option<String>,
}

/// Tracks the two children of a bracket so a fill on one side cancels the
/// other (OCO). Keyed by parent (entry) order id.
#[derive(Debug, Clone)]
struct BracketLink {
    account_id: String,
    stop_id: Option<String>,
    target_id: Option<String>,
}

/// A fill observed exactly once, deduplicated by `(order_id, exec_seq)`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub exec_seq: u64,
    pub fill_price: f64,
    pub fill_qty: f64,
}

pub struct OrderManager {
    broker: Arc<BrokerClient>,
    accounts: Arc<AccountStore>,
    risk: Arc<RiskMonitor>,
    store: Arc<Store>,
    events: Arc<EventBus>,
    strategies: Arc<StrategyRuntime>,
    /// §6 Configuration `RISK_AUTO_FLATTEN_ON_VIOLATION`: whether a
    /// non-compliance transition also flattens the account, not just
    /// disables its strategies.
    auto_flatten_on_violation: bool,
    brackets: RwLock<HashMap<String, BracketLink>>,
    /// Stop-entry children awaiting submission once the entry itself fills.
    pending_children: RwLock<HashMap<String, (OrderSide, f64, BracketOpts)>>,
    breakeven_done: RwLock<HashSet<String>>,
    seen_fills: RwLock<HashSet<(String, u64)>>,
    /// Per (account_id, symbol) fill log, fed to `consolidate_fifo` on every
    /// fill so closed round-trips are persisted as they happen (§9).
    fill_log: RwLock<HashMap<(String, String), Vec<Fill>>>,
    /// How many of `consolidate_fifo`'s trades for a key are already in the
    /// store, so re-running consolidation over the growing log only inserts
    /// the newly-closed suffix.
    recorded_trade_counts: RwLock<HashMap<(String, String), usize>>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<BrokerClient>,
        accounts: Arc<AccountStore>,
        risk: Arc<RiskMonitor>,
        store: Arc<Store>,
        events: Arc<EventBus>,
        strategies: Arc<StrategyRuntime>,
        auto_flatten_on_violation: bool,
    ) -> Self {
        Self {
            broker,
            accounts,
            risk,
            store,
            events,
            strategies,
            auto_flatten_on_violation,
            brackets: RwLock::new(HashMap::new()),
            pending_children: RwLock::new(HashMap::new()),
            breakeven_done: RwLock::new(HashSet::new()),
            seen_fills: RwLock::new(HashSet::new()),
            fill_log: RwLock::new(HashMap::new()),
            recorded_trade_counts: RwLock::new(HashMap::new()),
        }
    }

    fn gate(&self, account_id: &str, symbol: &str, notional: f64) -> Result<(), EngineError> {
        let intent = TradeIntent { account_id: account_id.to_string(), symbol: symbol.to_string(), notional };
        self.risk.evaluate_result(&intent)
    }

    /// Rejects a cross-tick price pre-submit instead of silently rounding it
    /// (§4.C): a price the caller supplied must already sit on a tick
    /// boundary.
    fn check_tick_aligned(contract: &Contract, price: f64) -> Result<(), EngineError> {
        if contract.is_tick_aligned(price) {
            Ok(())
        } else {
            Err(EngineError::InvalidPrice(format!(
                "{price} is not aligned to {}'s tick size {}",
                contract.symbol, contract.tick_size
            )))
        }
    }

    /// Places a MARKET entry; if `opts` carries bracket prices, the protective
    /// STOP and target LIMIT children are placed immediately after the entry
    /// fills and linked as OCO (§4.I).
    pub async fn submit_market(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        contract: &Contract,
        opts: BracketOpts,
    ) -> Result<Order, EngineError> {
        self.gate(account_id, symbol, qty * contract.point_value)?;

        let req = OrderRequest {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "MARKET".to_string(),
            quantity: qty,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day.as_str().to_string(),
            reduce_only: opts.reduce_only,
            idempotency_key: opts.idempotency_key.clone(),
        };
        let entry = self.broker.place_order(&req).await?;
        info!(account_id, symbol, order_id = %entry.id, "market entry submitted");

        if entry.status == OrderStatus::Filled && (opts.stop_loss_price.is_some() || opts.take_profit_price.is_some()) {
            self.place_bracket_children(account_id, symbol, side, qty, contract, &entry.id, opts).await?;
        }

        Ok(entry)
    }

    /// Places a STOP entry with pre-declared child prices; children are
    /// tracked locally and only submitted once the entry fills (observed via
    /// `watch_fills`).
    pub async fn submit_stop_entry(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        stop_price: f64,
        contract: &Contract,
        opts: BracketOpts,
    ) -> Result<Order, EngineError> {
        Self::check_tick_aligned(contract, stop_price)?;
        self.gate(account_id, symbol, qty * contract.point_value)?;

        let req = OrderRequest {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "STOP".to_string(),
            quantity: qty,
            limit_price: None,
            stop_price: Some(stop_price),
            time_in_force: TimeInForce::Day.as_str().to_string(),
            reduce_only: opts.reduce_only,
            idempotency_key: opts.idempotency_key.clone(),
        };
        let entry = self.broker.place_order(&req).await?;
        info!(account_id, symbol, order_id = %entry.id, stop_price, "stop entry submitted");

        self.brackets.write().insert(
            entry.id.clone(),
            BracketLink { account_id: account_id.to_string(), stop_id: None, target_id: None },
        );
        self.pending_children.write().insert(entry.id.clone(), (side, qty, opts));

        Ok(entry)
    }

    /// Places a LIMIT entry (§6 `order_type ∈ {market,limit,stop}`); brackets
    /// on fill follow the same queued-children path as `submit_stop_entry`.
    pub async fn submit_limit(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        contract: &Contract,
        opts: BracketOpts,
    ) -> Result<Order, EngineError> {
        Self::check_tick_aligned(contract, limit_price)?;
        self.gate(account_id, symbol, qty * contract.point_value)?;

        let req = OrderRequest {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "LIMIT".to_string(),
            quantity: qty,
            limit_price: Some(limit_price),
            stop_price: None,
            time_in_force: TimeInForce::Day.as_str().to_string(),
            reduce_only: opts.reduce_only,
            idempotency_key: opts.idempotency_key.clone(),
        };
        let entry = self.broker.place_order(&req).await?;
        info!(account_id, symbol, order_id = %entry.id, limit_price, "limit entry submitted");

        self.brackets.write().insert(
            entry.id.clone(),
            BracketLink { account_id: account_id.to_string(), stop_id: None, target_id: None },
        );
        self.pending_children.write().insert(entry.id.clone(), (side, qty, opts));

        Ok(entry)
    }

    async fn place_bracket_children(
        &self,
        account_id: &str,
        symbol: &str,
        entry_side: OrderSide,
        qty: f64,
        contract: &Contract,
        parent_id: &str,
        opts: BracketOpts,
    ) -> Result<(), EngineError> {
        let exit_side = entry_side.opposite();
        let mut link = BracketLink { account_id: account_id.to_string(), stop_id: None, target_id: None };

        if let Some(sl) = opts.stop_loss_price {
            Self::check_tick_aligned(contract, sl)?;
            let req = OrderRequest {
                account_id: account_id.to_string(),
                symbol: symbol.to_string(),
                side: exit_side.to_string(),
                order_type: "STOP".to_string(),
                quantity: qty,
                limit_price: None,
                stop_price: Some(sl),
                time_in_force: TimeInForce::Gtc.as_str().to_string(),
                reduce_only: true,
                idempotency_key: None,
            };
            let order = self.broker.place_order(&req).await?;
            link.stop_id = Some(order.id);
        }

        if let Some(tp) = opts.take_profit_price {
            Self::check_tick_aligned(contract, tp)?;
            let req = OrderRequest {
                account_id: account_id.to_string(),
                symbol: symbol.to_string(),
                side: exit_side.to_string(),
                order_type: "LIMIT".to_string(),
                quantity: qty,
                limit_price: Some(tp),
                stop_price: None,
                time_in_force: TimeInForce::Gtc.as_str().to_string(),
                reduce_only: true,
                idempotency_key: None,
            };
            let order = self.broker.place_order(&req).await?;
            link.target_id = Some(order.id);
        }

        debug!(account_id, symbol, parent_id, ?link, "bracket children placed");
        self.brackets.write().insert(parent_id.to_string(), link);
        Ok(())
    }

    /// Links two already-submitted orders as an OCO pair: a fill on either
    /// cancels the other. Used for the reference strategy's paired long/short
    /// stop-entries, in addition to the protective stop/target pairing
    /// `place_bracket_children` sets up automatically.
    pub fn link_oco(&self, account_id: &str, a: &str, b: &str) {
        self.brackets.write().insert(
            a.to_string(),
            BracketLink { account_id: account_id.to_string(), stop_id: Some(a.to_string()), target_id: Some(b.to_string()) },
        );
    }

    pub async fn modify_order(&self, id: &str, price: Option<f64>, qty: Option<f64>) -> Result<Order, EngineError> {
        self.broker.modify_order(id, price, qty).await
    }

    pub async fn cancel_order(&self, id: &str) -> Result<(), EngineError> {
        self.broker.cancel_order(id).await
    }

    pub async fn cancel_all(&self, account_id: &str) -> Result<(), EngineError> {
        self.broker.cancel_all_for_account(account_id).await
    }

    pub async fn flatten_symbol(&self, account_id: &str, symbol: &str) -> Result<(), EngineError> {
        self.broker.flatten_symbol(account_id, symbol).await
    }

    /// Closes every open position for the account with MARKET orders, after
    /// first cancelling all working orders (§4.I).
    pub async fn flatten_all(&self, account_id: &str) -> Result<(), EngineError> {
        warn!(account_id, "flattening all positions");
        self.cancel_all(account_id).await?;
        let positions = self.accounts.snapshot(account_id).positions;
        for position in positions {
            self.broker.flatten_symbol(account_id, &position.symbol).await?;
        }
        Ok(())
    }

    /// Processes one fill observed from the broker stream (or reconciliation
    /// pass), deduplicated by `(order_id, exec_seq)`: submits a stop-entry's
    /// queued children on its own fill, or cancels the OCO sibling when a
    /// bracket child fills.
    pub async fn on_fill(&self, fill: FillEvent) -> Result<(), EngineError> {
        if !self.seen_fills.write().insert((fill.order_id.clone(), fill.exec_seq)) {
            return Ok(());
        }
        info!(order_id = %fill.order_id, exec_seq = fill.exec_seq, "fill observed");

        let queued_children = self.pending_children.write().remove(&fill.order_id);
        if let Some((side, qty, opts)) = queued_children {
            let contract = Contract {
                symbol: fill.symbol.clone(),
                contract_id: String::new(),
                tick_size: 0.0,
                tick_value: 0.0,
                point_value: 1.0,
                exchange: String::new(),
                description: String::new(),
            };
            self.place_bracket_children(&fill.account_id, &fill.symbol, side, qty, &contract, &fill.order_id, opts)
                .await?;
            return Ok(());
        }

        let sibling_to_cancel = {
            let mut brackets = self.brackets.write();
            brackets.values_mut().find_map(|link| {
                if link.stop_id.as_deref() == Some(fill.order_id.as_str()) {
                    link.target_id.take()
                } else if link.target_id.as_deref() == Some(fill.order_id.as_str()) {
                    link.stop_id.take()
                } else {
                    None
                }
            })
        };
        if let Some(sibling_id) = sibling_to_cancel {
            info!(order_id = %fill.order_id, sibling_id, "OCO sibling cancelled after fill");
            self.broker.cancel_order(&sibling_id).await?;
        }

        self.consolidate_and_persist(&fill).await;

        Ok(())
    }

    /// Appends `fill` to its (account, symbol) fill log, re-runs FIFO
    /// consolidation, and persists whichever closed trades are new (§9).
    /// The order's side isn't on `FillEvent` itself, so it's looked up via
    /// the account's open orders; a lookup failure just skips consolidation
    /// for this fill; the fill itself has already been accepted above.
    async fn consolidate_and_persist(&self, fill: &FillEvent) {
        let side = match self.broker.get_orders(&fill.account_id).await {
            Ok(orders) => orders.iter().find(|o| o.id == fill.order_id).map(|o| o.side),
            Err(e) => {
                warn!(order_id = %fill.order_id, error = %e, "could not look up order side for trade consolidation");
                None
            }
        };
        let Some(side) = side else { return };
        self.record_fill_and_persist_new_trades(fill, side).await;
    }

    /// Pure bookkeeping half of [`Self::consolidate_and_persist`], split out
    /// so it's testable without a live broker round trip for the side
    /// lookup. Feeds every newly-closed trade's realized PnL into the
    /// account's risk monitor (§4.H: "recomputed on every fill"); a
    /// compliant-to-non-compliant transition triggers the violation handler.
    async fn record_fill_and_persist_new_trades(&self, fill: &FillEvent, side: OrderSide) {
        let key = (fill.account_id.clone(), fill.symbol.clone());
        let trades = {
            let mut log = self.fill_log.write();
            let entry = log.entry(key.clone()).or_default();
            entry.push(Fill {
                order_id: fill.order_id.clone(),
                exec_seq: fill.exec_seq,
                account_id: fill.account_id.clone(),
                symbol: fill.symbol.clone(),
                side,
                quantity: fill.fill_qty,
                price: fill.fill_price,
                timestamp: chrono::Utc::now(),
            });
            consolidate_fifo(entry, &fill.account_id, &fill.symbol)
        };

        let already_recorded = *self.recorded_trade_counts.read().get(&key).unwrap_or(&0);
        let mut violated = false;
        for trade in trades.iter().skip(already_recorded) {
            if let Err(e) = self.store.insert_trade(trade) {
                warn!(account_id = %fill.account_id, symbol = %fill.symbol, error = %e, "failed to persist consolidated trade");
                return;
            }
            violated |= self.risk.on_fill(trade.net_pnl);
        }
        self.recorded_trade_counts.write().insert(key, trades.len());

        if violated {
            self.handle_risk_violation(&fill.account_id).await;
        }
    }

    /// §4.H / S4: on a compliant-to-non-compliant transition, stop all
    /// trading on the account, optionally flatten it, and leave a durable
    /// record of why. Also driven directly from `main.rs`'s balance-update
    /// and risk-ticker loops, which observe a transition outside any fill.
    pub(crate) async fn handle_risk_violation(&self, account_id: &str) {
        let snapshot = self.risk.snapshot();
        warn!(account_id, "risk violation: disabling strategies for account");
        self.events.publish(Topic::RiskUpdate, Event::Risk(snapshot));
        self.strategies.disable_all(account_id);

        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            timestamp: chrono::Utc::now(),
            level: NotificationLevel::Error,
            message: format!("account {account_id} is non-compliant; strategies disabled"),
            meta: serde_json::json!({}),
        };
        if let Err(e) = self.store.insert_notification(&notification) {
            warn!(account_id, error = %e, "failed to persist risk violation notification");
        }
        self.events.publish(Topic::Notification, Event::Notification(notification));

        if self.auto_flatten_on_violation {
            if let Err(e) = self.flatten_all(account_id).await {
                error!(account_id, error = %e, "auto-flatten on risk violation failed");
            }
        }
    }

    /// Moves the protective stop to `entry ± 1 tick` once unrealized profit
    /// reaches `trigger_points`; runs at most once per position (§4.I).
    pub async fn manage_breakeven(&self, position: &Position, trigger_points: f64, contract: &Contract) -> Result<(), EngineError> {
        if self.breakeven_done.read().contains(&position.symbol) {
            return Ok(());
        }
        let favorable_move = (position.current_price - position.avg_entry_price) * position.side.sign();
        if favorable_move < trigger_points {
            return Ok(());
        }

        let stop_id = self
            .brackets
            .read()
            .values()
            .find(|l| l.account_id == position.account_id)
            .and_then(|l| l.stop_id.clone());
        let Some(stop_id) = stop_id else { return Ok(()) };

        let breakeven_price = position.avg_entry_price + contract.tick_size * position.side.sign();
        self.broker.modify_order(&stop_id, Some(contract.round_to_tick(breakeven_price)), None).await?;
        self.breakeven_done.write().insert(position.symbol.clone());
        info!(symbol = %position.symbol, breakeven_price, "protective stop moved to breakeven");
        Ok(())
    }

    /// At the configured local flatten time: cancel working orders then
    /// close every open position with MARKET (§4.I).
    pub async fn flatten_eod(&self, account_id: &str) -> Result<(), EngineError> {
        info!(account_id, "end-of-day flatten triggered");
        self.flatten_all(account_id).await
    }

    /// Continuously translates `trade_fill` events from the broker stream
    /// hub into deduplicated `FillEvent`s. Runs alongside the 30s REST
    /// reconciliation loop driven separately by `AccountStore::reconcile`
    /// (§4.I).
    pub async fn watch_fills(&self, mut events: tokio::sync::broadcast::Receiver<HubEvent>) {
        loop {
            match events.recv().await {
                Ok(event) if event.topic == "trade_fill" => {
                    if let Ok(fill) = serde_json::from_value::<FillEvent>(event.payload.clone()) {
                        if let Err(err) = self.on_fill(fill).await {
                            warn!(error = %err, "failed to process fill event");
                        }
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch_fills lagged, some fill events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Contract {
        Contract {
            symbol: "MNQ".into(),
            contract_id: "CON.F.US.MNQ.H25".into(),
            tick_size: 0.25,
            tick_value: 0.5,
            point_value: 2.0,
            exchange: "CME".into(),
            description: String::new(),
        }
    }

    fn manager() -> OrderManager {
        let broker = Arc::new(BrokerClient::new("https://example.test", "u", "k"));
        let accounts = Arc::new(AccountStore::new(broker.clone()));
        let risk = Arc::new(RiskMonitor::new("A1", 50_000.0, 1_000.0, 2_000.0, 3_000.0));
        let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
        let events = EventBus::new();
        let strategies = Arc::new(StrategyRuntime::new(store.clone(), chrono_tz::America::Chicago));
        OrderManager::new(broker, accounts, risk, store, events, strategies, true)
    }

    #[test]
    fn gate_allows_when_compliant() {
        let mgr = manager();
        assert!(mgr.gate("A1", "MNQ", 1000.0).is_ok());
    }

    #[tokio::test]
    async fn duplicate_fill_is_ignored() {
        let mgr = manager();
        let fill = FillEvent {
            order_id: "O1".into(),
            account_id: "A1".into(),
            symbol: "MNQ".into(),
            exec_seq: 1,
            fill_price: 100.0,
            fill_qty: 1.0,
        };
        assert!(mgr.on_fill(fill.clone()).await.is_ok());
        assert_eq!(mgr.seen_fills.read().len(), 1);
        assert!(mgr.on_fill(fill).await.is_ok());
        assert_eq!(mgr.seen_fills.read().len(), 1);
    }

    #[tokio::test]
    async fn closed_round_trip_is_persisted_as_a_trade() {
        let mgr = manager();
        let entry = FillEvent { order_id: "O1".into(), account_id: "A1".into(), symbol: "MNQ".into(), exec_seq: 1, fill_price: 100.0, fill_qty: 1.0 };
        let exit = FillEvent { order_id: "O2".into(), account_id: "A1".into(), symbol: "MNQ".into(), exec_seq: 2, fill_price: 105.0, fill_qty: 1.0 };
        mgr.record_fill_and_persist_new_trades(&entry, OrderSide::Buy).await;
        mgr.record_fill_and_persist_new_trades(&exit, OrderSide::Sell).await;

        let trades = mgr.store.load_trades("A1", 10, None).expect("load trades");
        assert_eq!(trades.len(), 1);
        assert!((trades[0].net_pnl - 5.0).abs() < 1e-9);

        // Re-running consolidation over the same log must not double-insert.
        mgr.record_fill_and_persist_new_trades(&exit, OrderSide::Sell).await;
        let trades_again = mgr.store.load_trades("A1", 10, None).expect("load trades");
        assert_eq!(trades_again.len(), 1);
    }

    #[test]
    fn rejects_cross_tick_stop_price() {
        let c = contract();
        assert!(OrderManager::check_tick_aligned(&c, 25_000.13).is_err());
        assert!(OrderManager::check_tick_aligned(&c, 25_000.25).is_ok());
    }

    #[test]
    fn breakeven_marker_is_recorded_per_symbol() {
        let mgr = manager();
        mgr.breakeven_done.write().insert("MNQ".to_string());
        assert!(mgr.breakeven_done.read().contains("MNQ"));
    }

    #[test]
    fn tick_rounding_used_for_bracket_children() {
        let c = contract();
        assert_eq!(c.round_to_tick(100.1), 100.0);
    }
}
