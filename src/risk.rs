// =============================================================================
// Risk Monitor (§4.H) — DLL / MLL (trailing) / consistency compliance gate
// =============================================================================
//
// Grounded almost directly on the teacher's `RiskEngine`: the same
// RwLock<Inner>-plus-immutable-limits shape, the same "recompute on every
// event, snapshot under a read lock" posture. The four generic circuit
// breakers (daily loss / consecutive losses / drawdown / trade count) are
// replaced with the prop-firm-specific pair this engine actually needs: a
// Daily Loss Limit and a trailing Max Loss Limit with a ratcheting
// high-water mark, plus a consistency-rule hook left as an explicit stub.

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{LimitSnapshot, RiskSnapshot};
use crate::error::EngineError;

/// A pre-trade intent, minimal enough for the risk gate to reason about
/// without depending on the order manager's richer request types.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub account_id: String,
    pub symbol: String,
    pub notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    Veto(String),
}

/// The consistency rule named in §9's resolved Open Question: a stub that
/// always reports compliant until a concrete prop-firm consistency policy
/// (e.g. "no single day > 40% of total profit") is specified.
pub trait ConsistencyRule: Send + Sync {
    fn violated(&self, _snapshot: &RiskSnapshot) -> bool {
        false
    }
}

pub struct NoConsistencyRule;
impl ConsistencyRule for NoConsistencyRule {}

struct Inner {
    balance: f64,
    start_of_day_balance: f64,
    realized_pnl_today: f64,
    unrealized_pnl_total: f64,
    high_water_mark: f64,
    trailing_locked: bool,
    compliance: bool,
    events: Vec<String>,
}

/// Per-account risk monitor. One instance per account, held by `CoreContext`
/// in an `Arc<RwLock<HashMap<String, RiskMonitor>>>` or similar aggregate —
/// this type itself only knows about the single account it was built for.
pub struct RiskMonitor {
    account_id: String,
    state: RwLock<Inner>,
    dll_limit: f64,
    mll_limit: f64,
    trail_threshold: f64,
    consistency_rule: Box<dyn ConsistencyRule>,
}

impl RiskMonitor {
    pub fn new(account_id: impl Into<String>, start_of_day_balance: f64, dll_limit: f64, mll_limit: f64, trail_threshold: f64) -> Self {
        let account_id = account_id.into();
        info!(account_id = %account_id, start_of_day_balance, dll_limit, mll_limit, trail_threshold, "risk monitor initialised");
        Self {
            account_id,
            state: RwLock::new(Inner {
                balance: start_of_day_balance,
                start_of_day_balance,
                realized_pnl_today: 0.0,
                unrealized_pnl_total: 0.0,
                high_water_mark: start_of_day_balance,
                trailing_locked: false,
                compliance: true,
                events: Vec::new(),
            }),
            dll_limit,
            mll_limit,
            trail_threshold,
            consistency_rule: Box::new(NoConsistencyRule),
        }
    }

    /// Recompute on every fill: the teacher's `record_trade_result`
    /// generalized to also ratchet the trailing high-water mark. Returns
    /// `true` exactly when this call pushed the account from compliant to
    /// non-compliant, so the caller can drive §4.H's violation consequences.
    pub fn on_fill(&self, realized_pnl: f64) -> bool {
        let mut s = self.state.write();
        s.realized_pnl_today += realized_pnl;
        s.balance += realized_pnl;
        self.ratchet_high_water_mark(&mut s);
        self.recompute_compliance(&mut s)
    }

    /// Recompute on every balance update from the account projection.
    /// Returns `true` on a compliant-to-non-compliant transition.
    pub fn on_balance_update(&self, balance: f64) -> bool {
        let mut s = self.state.write();
        s.balance = balance;
        self.ratchet_high_water_mark(&mut s);
        self.recompute_compliance(&mut s)
    }

    /// Recompute on the 15s risk ticker, folding in live unrealized PnL
    /// across all open positions for this account. Returns `true` on a
    /// compliant-to-non-compliant transition.
    pub fn on_tick(&self, total_unrealized_pnl: f64) -> bool {
        let mut s = self.state.write();
        s.unrealized_pnl_total = total_unrealized_pnl;
        self.recompute_compliance(&mut s)
    }

    /// Prop-firm trailing rule: the high-water mark ratchets up with
    /// balance, but freezes once balance first reaches
    /// `start_of_day_balance + trail_threshold` (§4.H).
    fn ratchet_high_water_mark(&self, s: &mut Inner) {
        if s.trailing_locked {
            return;
        }
        if s.balance >= s.start_of_day_balance + self.trail_threshold {
            s.trailing_locked = true;
            debug!(account_id = %self.account_id, balance = s.balance, "trailing high-water mark locked");
            return;
        }
        if s.balance > s.high_water_mark {
            s.high_water_mark = s.balance;
        }
    }

    /// Returns `true` exactly on the transition from compliant to
    /// non-compliant (never on an already-non-compliant recompute, so
    /// callers trigger the violation consequences once per breach).
    fn recompute_compliance(&self, s: &mut Inner) -> bool {
        let snapshot = self.build_snapshot(s);
        let was_compliant = s.compliance;
        s.compliance = snapshot.compliance;

        let just_violated = was_compliant && !s.compliance;
        if just_violated {
            let msg = format!("account {} transitioned to non-compliance", self.account_id);
            warn!("{msg}");
            s.events.push(msg);
        }
        just_violated
    }

    fn build_snapshot(&self, s: &Inner) -> RiskSnapshot {
        let total_pnl = s.balance - s.start_of_day_balance + s.unrealized_pnl_total;
        let dll_used = (-s.realized_pnl_today).max(0.0);
        let dll = LimitSnapshot::new(self.dll_limit, dll_used);

        let mll_used = (s.high_water_mark - s.balance).max(0.0);
        let mll = LimitSnapshot::new(self.mll_limit, mll_used);

        let partial = RiskSnapshot {
            account_id: self.account_id.clone(),
            balance: s.balance,
            start_balance: s.start_of_day_balance,
            total_pnl,
            dll,
            mll,
            trailing_loss: mll_used,
            compliance: false,
            events: s.events.clone(),
        };
        let consistency_violated = self.consistency_rule.violated(&partial);
        let compliance = !partial.dll.violated && !partial.mll.violated && !consistency_violated;

        RiskSnapshot { compliance, ..partial }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let s = self.state.read();
        self.build_snapshot(&s)
    }

    /// Pre-trade gate: `OrderManager` and `StrategyRuntime` must call this
    /// before acting on any intent. Any violation vetoes (§4.H).
    pub fn evaluate(&self, intent: &TradeIntent) -> GateDecision {
        let snapshot = self.snapshot();
        if !snapshot.compliance {
            return GateDecision::Veto(format!(
                "account {} is non-compliant (dll_violated={}, mll_violated={})",
                intent.account_id, snapshot.dll.violated, snapshot.mll.violated
            ));
        }
        GateDecision::Allow
    }

    pub fn evaluate_result(&self, intent: &TradeIntent) -> Result<(), EngineError> {
        match self.evaluate(intent) {
            GateDecision::Allow => Ok(()),
            GateDecision::Veto(reason) => Err(EngineError::RiskVeto(reason)),
        }
    }

    /// Roll daily counters over at session start — start-of-day balance and
    /// realized PnL reset; the trailing high-water mark and its lock persist
    /// across days per the prop-firm trailing rule.
    pub fn roll_session(&self, new_start_of_day_balance: f64) {
        let mut s = self.state.write();
        s.start_of_day_balance = new_start_of_day_balance;
        s.realized_pnl_today = 0.0;
        info!(account_id = %self.account_id, new_start_of_day_balance, "risk monitor session rolled");
    }
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("account_id", &self.account_id)
            .field("dll_limit", &self.dll_limit)
            .field("mll_limit", &self.mll_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> TradeIntent {
        TradeIntent { account_id: "A1".into(), symbol: "MNQ".into(), notional: 1000.0 }
    }

    #[test]
    fn allows_trading_when_compliant() {
        let monitor = RiskMonitor::new("A1", 50_000.0, 1_000.0, 2_000.0, 3_000.0);
        assert_eq!(monitor.evaluate(&intent()), GateDecision::Allow);
    }

    #[test]
    fn vetoes_when_dll_exceeded() {
        let monitor = RiskMonitor::new("A1", 50_000.0, 500.0, 2_000.0, 3_000.0);
        monitor.on_fill(-600.0);
        match monitor.evaluate(&intent()) {
            GateDecision::Veto(_) => {}
            GateDecision::Allow => panic!("expected veto after DLL breach"),
        }
    }

    #[test]
    fn trailing_high_water_mark_ratchets_then_locks() {
        let monitor = RiskMonitor::new("A1", 50_000.0, 1_000.0, 2_000.0, 1_000.0);
        monitor.on_balance_update(50_500.0);
        assert_eq!(monitor.state.read().high_water_mark, 50_500.0);

        // Balance crosses start + trail_threshold -> lock.
        monitor.on_balance_update(51_200.0);
        assert!(monitor.state.read().trailing_locked);
        let locked_hwm = monitor.state.read().high_water_mark;

        // Further balance drop should not move the locked HWM down nor up.
        monitor.on_balance_update(50_800.0);
        assert_eq!(monitor.state.read().high_water_mark, locked_hwm);
    }

    #[test]
    fn mll_violation_vetoes_trading() {
        let monitor = RiskMonitor::new("A1", 50_000.0, 5_000.0, 500.0, 10_000.0);
        monitor.on_balance_update(50_600.0);
        monitor.on_balance_update(50_000.0); // 600 drawdown from HWM > 500 limit
        match monitor.evaluate(&intent()) {
            GateDecision::Veto(_) => {}
            GateDecision::Allow => panic!("expected veto after MLL breach"),
        }
    }

    #[test]
    fn roll_session_resets_daily_pnl_but_keeps_trailing_lock() {
        let monitor = RiskMonitor::new("A1", 50_000.0, 1_000.0, 2_000.0, 500.0);
        monitor.on_balance_update(50_600.0);
        assert!(monitor.state.read().trailing_locked);

        monitor.roll_session(50_600.0);
        assert_eq!(monitor.state.read().realized_pnl_today, 0.0);
        assert!(monitor.state.read().trailing_locked);
    }
}
