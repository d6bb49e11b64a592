use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl PositionSide {
    /// +1 for LONG, -1 for SHORT — convenient for signed P&L math.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

/// An open or recently-closed position for `(account_id, symbol)`.
///
/// Invariant: at most one open position exists per `(account_id, symbol)`;
/// opposing fills net the existing position down rather than creating a
/// second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub linked_order_ids: Vec<String>,
}

impl Position {
    /// Recompute `unrealized_pnl` from a fresh quote; `point_value` converts
    /// price distance into account currency.
    pub fn mark_to_market(&mut self, current_price: f64, point_value: f64) {
        self.current_price = current_price;
        let distance = (current_price - self.avg_entry_price) * self.side.sign();
        self.unrealized_pnl = distance * self.quantity * point_value;
    }

    pub fn is_flat(&self) -> bool {
        self.quantity <= 0.0
    }
}
