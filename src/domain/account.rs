use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A prop-firm trading account, reconciled against the broker every 60s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Realized cash balance.
    pub balance: f64,
    /// Balance plus unrealized P&L.
    pub equity: f64,
    pub currency: String,
    pub status: AccountStatus,
    pub start_of_day_balance: f64,
    pub account_type: String,
}
