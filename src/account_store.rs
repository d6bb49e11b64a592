// =============================================================================
// Account/Position Store (§4.G)
// =============================================================================
//
// Grounded on the teacher's `PositionManager` (open/closed position lists
// behind `parking_lot::RwLock`) and `reconcile.rs` (REST-driven drift
// detection, "never auto-cancel" safety posture). Generalized from a single
// global position list into a per-account projection, with the teacher's
// stream-vs-reconcile split made explicit as two write paths instead of one
// periodic background job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::domain::{Account, Order, Position};
use crate::error::EngineError;

/// One tick-value's worth of balance drift is tolerated before a
/// reconciliation pass is treated as a meaningful divergence (§4.G).
const BALANCE_DRIFT_TOLERANCE_TICKS: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct AccountProjection {
    pub account: Option<Account>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub account_id: String,
    pub positions_matched: u32,
    pub positions_diverged: u32,
    pub orders_diverged: u32,
    pub balance_diverged: bool,
}

/// Per-account projection store. Each account gets its own lock so that
/// reconciling one account never blocks reads/writes on another (§4.G:
/// "writes are serialized per account").
pub struct AccountStore {
    broker: Arc<BrokerClient>,
    accounts: RwLock<HashMap<String, Arc<RwLock<AccountProjection>>>>,
}

impl AccountStore {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self { broker, accounts: RwLock::new(HashMap::new()) }
    }

    fn slot(&self, account_id: &str) -> Arc<RwLock<AccountProjection>> {
        if let Some(slot) = self.accounts.read().get(account_id) {
            return slot.clone();
        }
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(AccountProjection::default())))
            .clone()
    }

    /// Snapshot for readers — a cheap clone under a single read lock, never
    /// exposed as a live reference (§4.G: "single read lock" guarantee).
    pub fn snapshot(&self, account_id: &str) -> AccountProjection {
        self.slot(account_id).read().clone()
    }

    // -- Stream path (fast, optimistic) ------------------------------------

    pub fn apply_position_update(&self, account_id: &str, position: Position) {
        let slot = self.slot(account_id);
        let mut proj = slot.write();
        if let Some(existing) = proj.positions.iter_mut().find(|p| p.symbol == position.symbol) {
            *existing = position;
        } else {
            proj.positions.push(position);
        }
        proj.positions.retain(|p| !p.is_flat());
    }

    pub fn apply_order_update(&self, account_id: &str, order: Order) {
        let slot = self.slot(account_id);
        let mut proj = slot.write();
        if let Some(existing) = proj.orders.iter_mut().find(|o| o.id == order.id) {
            *existing = order;
        } else {
            proj.orders.push(order);
        }
        proj.orders.retain(|o| !o.status.is_terminal());
    }

    pub fn apply_account_update(&self, account: Account) {
        let slot = self.slot(&account.id);
        slot.write().account = Some(account);
    }

    // -- Reconciliation path (authoritative, every 60s or on demand) -------

    /// Pull full state via REST and replace the projection atomically if
    /// divergence exceeds tolerance. Never cancels orders or closes
    /// positions itself — only the `OrderManager` acting on a caller's
    /// explicit intent does that (teacher's reconcile.rs safety posture).
    pub async fn reconcile(&self, account_id: &str) -> Result<ReconcileSummary, EngineError> {
        info!(account_id, "account reconciliation started");

        let remote_positions = self.broker.get_positions(account_id).await?;
        let remote_orders = self.broker.get_orders(account_id).await?;

        let slot = self.slot(account_id);
        let mut summary = ReconcileSummary { account_id: account_id.to_string(), ..Default::default() };

        {
            let local = slot.read();
            for remote in &remote_positions {
                match local.positions.iter().find(|p| p.symbol == remote.symbol) {
                    Some(local_pos) if (local_pos.quantity - remote.quantity).abs() < f64::EPSILON => {
                        summary.positions_matched += 1;
                    }
                    Some(local_pos) => {
                        warn!(account_id, symbol = %remote.symbol, local = local_pos.quantity, remote = remote.quantity, "position quantity diverged");
                        summary.positions_diverged += 1;
                    }
                    None => {
                        warn!(account_id, symbol = %remote.symbol, "position missing locally, found on broker");
                        summary.positions_diverged += 1;
                    }
                }
            }

            for remote in &remote_orders {
                match local.orders.iter().find(|o| o.id == remote.id) {
                    Some(local_order) if local_order.status == remote.status => {}
                    _ => {
                        debug!(account_id, order_id = %remote.id, "order status diverged or missing locally");
                        summary.orders_diverged += 1;
                    }
                }
            }

            if let Some(local_account) = local.account.as_ref() {
                if let Ok(remote_account) = self.broker.list_accounts().await.map(|accounts| {
                    accounts.into_iter().find(|a| a.id == account_id)
                }) {
                    if let Some(remote_account) = remote_account {
                        if (local_account.balance - remote_account.balance).abs() > BALANCE_DRIFT_TOLERANCE_TICKS {
                            summary.balance_diverged = true;
                        }
                    }
                }
            }
        }

        let mut proj = slot.write();
        proj.positions = remote_positions;
        proj.orders = remote_orders;

        info!(
            account_id,
            matched = summary.positions_matched,
            positions_diverged = summary.positions_diverged,
            orders_diverged = summary.orders_diverged,
            balance_diverged = summary.balance_diverged,
            "account reconciliation completed"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, OrderStatus, OrderType, PositionSide, TimeInForce};
    use chrono::Utc;

    fn sample_store() -> AccountStore {
        AccountStore::new(Arc::new(BrokerClient::new("https://example.test", "u", "k")))
    }

    fn sample_position(symbol: &str, qty: f64) -> Position {
        Position {
            account_id: "A1".into(),
            symbol: symbol.into(),
            side: PositionSide::Long,
            quantity: qty,
            avg_entry_price: 100.0,
            current_price: 100.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            opened_at: Utc::now(),
            linked_order_ids: vec![],
        }
    }

    #[test]
    fn stream_path_upserts_and_drops_flat_positions() {
        let store = sample_store();
        store.apply_position_update("A1", sample_position("MNQ", 2.0));
        assert_eq!(store.snapshot("A1").positions.len(), 1);

        store.apply_position_update("A1", sample_position("MNQ", 0.0));
        assert_eq!(store.snapshot("A1").positions.len(), 0);
    }

    #[test]
    fn stream_path_drops_terminal_orders() {
        let store = sample_store();
        let order = Order {
            id: "O1".into(),
            account_id: "A1".into(),
            symbol: "MNQ".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            reduce_only: false,
            status: OrderStatus::Filled,
            parent_id: None,
            bracket_role: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.apply_order_update("A1", order);
        assert_eq!(store.snapshot("A1").orders.len(), 0);
    }

    #[test]
    fn separate_accounts_do_not_share_state() {
        let store = sample_store();
        store.apply_position_update("A1", sample_position("MNQ", 1.0));
        store.apply_position_update("A2", sample_position("ES", 2.0));
        assert_eq!(store.snapshot("A1").positions.len(), 1);
        assert_eq!(store.snapshot("A2").positions.len(), 1);
        assert_eq!(store.snapshot("A1").positions[0].symbol, "MNQ");
    }
}
