use serde::{Deserialize, Serialize};

/// A single limit's current consumption (used for both DLL and MLL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSnapshot {
    pub limit: f64,
    pub used: f64,
    pub remaining: f64,
    pub pct: f64,
    pub violated: bool,
}

impl LimitSnapshot {
    pub fn new(limit: f64, used: f64) -> Self {
        let remaining = limit - used;
        let pct = if limit > 0.0 { (used / limit) * 100.0 } else { 0.0 };
        Self {
            limit,
            used,
            remaining,
            pct,
            violated: used >= limit,
        }
    }
}

/// Per-account risk state, recomputed on every fill/balance update/15s tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub account_id: String,
    pub balance: f64,
    pub start_balance: f64,
    pub total_pnl: f64,
    pub dll: LimitSnapshot,
    pub mll: LimitSnapshot,
    pub trailing_loss: f64,
    pub compliance: bool,
    pub events: Vec<String>,
}
