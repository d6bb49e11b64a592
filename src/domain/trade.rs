use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// A closed round-trip trade, derived by FIFO consolidation of fills (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub account_id: String,
    pub strategy_name: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub gross_pnl: f64,
    pub fees: f64,
    pub net_pnl: f64,
}

/// A single fill event as seen by the FIFO consolidator. `exec_seq` dedups
/// retried/duplicated stream deliveries.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub exec_seq: u64,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Consolidate an ordered fill log into closed trades using FIFO matching.
/// Pure function over an immutable slice — no shared state, so it is trivial
/// to property-test against partial fills and opposite-side netting.
pub fn consolidate_fifo(fills: &[Fill], account_id: &str, symbol: &str) -> Vec<TradeRecord> {
    let mut open_lots: Vec<Fill> = Vec::new();
    let mut trades = Vec::new();

    for fill in fills.iter().filter(|f| f.account_id == account_id && f.symbol == symbol) {
        let mut remaining = fill.quantity;

        while remaining > 1e-9 {
            match open_lots.first_mut() {
                Some(lot) if lot.side != fill.side => {
                    let matched = remaining.min(lot.quantity);
                    let (entry, exit) = (lot, fill);
                    let gross = match entry.side {
                        OrderSide::Buy => (exit.price - entry.price) * matched,
                        OrderSide::Sell => (entry.price - exit.price) * matched,
                    };
                    trades.push(TradeRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        account_id: account_id.to_string(),
                        strategy_name: None,
                        symbol: symbol.to_string(),
                        side: entry.side,
                        quantity: matched,
                        entry_price: entry.price,
                        exit_price: exit.price,
                        entry_time: entry.timestamp,
                        exit_time: exit.timestamp,
                        gross_pnl: gross,
                        fees: 0.0,
                        net_pnl: gross,
                    });

                    entry.quantity -= matched;
                    remaining -= matched;
                    if entry.quantity <= 1e-9 {
                        open_lots.remove(0);
                    }
                }
                _ => {
                    // No opposing lot to net against (or the book is empty):
                    // this fill opens or adds to a new lot.
                    open_lots.push(Fill {
                        order_id: fill.order_id.clone(),
                        exec_seq: fill.exec_seq,
                        account_id: fill.account_id.clone(),
                        symbol: fill.symbol.clone(),
                        side: fill.side,
                        quantity: remaining,
                        price: fill.price,
                        timestamp: fill.timestamp,
                    });
                    remaining = 0.0;
                }
            }
        }
    }

    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(order_id: &str, seq: u64, side: OrderSide, qty: f64, price: f64) -> Fill {
        Fill {
            order_id: order_id.to_string(),
            exec_seq: seq,
            account_id: "A1".to_string(),
            symbol: "MNQ".to_string(),
            side,
            quantity: qty,
            price,
            timestamp: chrono::Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
        }
    }

    #[test]
    fn simple_round_trip_nets_to_one_trade() {
        let fills = vec![
            fill("o1", 1, OrderSide::Buy, 2.0, 100.0),
            fill("o2", 2, OrderSide::Sell, 2.0, 105.0),
        ];
        let trades = consolidate_fifo(&fills, "A1", "MNQ");
        assert_eq!(trades.len(), 1);
        assert!((trades[0].net_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn partial_fill_netting_splits_across_two_trades() {
        let fills = vec![
            fill("o1", 1, OrderSide::Buy, 3.0, 100.0),
            fill("o2", 2, OrderSide::Sell, 1.0, 110.0),
            fill("o3", 3, OrderSide::Sell, 2.0, 90.0),
        ];
        let trades = consolidate_fifo(&fills, "A1", "MNQ");
        assert_eq!(trades.len(), 2);
        assert!((trades[0].net_pnl - 10.0).abs() < 1e-9);
        assert!((trades[1].net_pnl - (-20.0)).abs() < 1e-9);
    }

    #[test]
    fn unmatched_fill_leaves_no_trade() {
        let fills = vec![fill("o1", 1, OrderSide::Buy, 1.0, 100.0)];
        let trades = consolidate_fifo(&fills, "A1", "MNQ");
        assert!(trades.is_empty());
    }
}
