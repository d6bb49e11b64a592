use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_atr_period() -> u32 {
    14
}

fn default_atr_timeframe() -> String {
    "5m".to_string()
}

fn default_stop_atr_multiplier() -> f64 {
    1.25
}

fn default_tp_atr_multiplier() -> f64 {
    2.0
}

fn default_breakeven_profit_points() -> f64 {
    10.0
}

fn default_range_break_offset() -> f64 {
    1.0
}

fn default_overnight_start() -> String {
    "18:00".to_string()
}

fn default_overnight_end() -> String {
    "08:30".to_string()
}

fn default_market_open() -> String {
    "08:30".to_string()
}

/// The three strategy kinds the runtime registers, per §4.J.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    OvernightRange,
    MeanReversion,
    TrendFollowing,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OvernightRange => write!(f, "OvernightRange"),
            Self::MeanReversion => write!(f, "MeanReversion"),
            Self::TrendFollowing => write!(f, "TrendFollowing"),
        }
    }
}

/// Tunable parameters for the Overnight Range Breakout reference strategy.
/// Every field carries a serde default so older persisted JSON/SQLite rows
/// always deserialize, matching the teacher's `StrategyParams` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    #[serde(default = "default_overnight_start")]
    pub overnight_start_time: String,
    #[serde(default = "default_overnight_end")]
    pub overnight_end_time: String,
    #[serde(default = "default_market_open")]
    pub market_open_time: String,
    #[serde(default = "default_atr_period")]
    pub atr_period: u32,
    #[serde(default = "default_atr_timeframe")]
    pub atr_timeframe: String,
    #[serde(default = "default_stop_atr_multiplier")]
    pub stop_atr_multiplier: f64,
    #[serde(default = "default_tp_atr_multiplier")]
    pub tp_atr_multiplier: f64,
    #[serde(default = "default_true")]
    pub breakeven_enabled: bool,
    #[serde(default = "default_breakeven_profit_points")]
    pub breakeven_profit_points: f64,
    #[serde(default = "default_range_break_offset")]
    pub range_break_offset: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            overnight_start_time: default_overnight_start(),
            overnight_end_time: default_overnight_end(),
            market_open_time: default_market_open(),
            atr_period: default_atr_period(),
            atr_timeframe: default_atr_timeframe(),
            stop_atr_multiplier: default_stop_atr_multiplier(),
            tp_atr_multiplier: default_tp_atr_multiplier(),
            breakeven_enabled: true,
            breakeven_profit_points: default_breakeven_profit_points(),
            range_break_offset: default_range_break_offset(),
        }
    }
}

/// Persisted per `(account_id, name)`. Written through on every config
/// change and loaded on startup (§4.J persistence contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: StrategyKind,
    pub account_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_position_size")]
    pub position_size: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default)]
    pub params: StrategyParams,
}

fn default_position_size() -> f64 {
    1.0
}

fn default_max_positions() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Disabled,
    EnabledIdle,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "DISABLED"),
            Self::EnabledIdle => write!(f, "ENABLED_IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// In-memory lifecycle state for a `(strategy, account)` pair. Stats are
/// projected from the trade log rather than stored redundantly here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub status: StrategyStatus,
    pub is_running: bool,
    pub last_tick: Option<chrono::DateTime<chrono::Utc>>,
    pub stats: StrategyStats,
    pub next_execution_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            status: StrategyStatus::Disabled,
            is_running: false,
            last_tick: None,
            stats: StrategyStats::default(),
            next_execution_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub total_trades: u32,
    pub winning: u32,
    pub total_pnl: f64,
    pub max_drawdown: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_config_roundtrips_through_json() {
        let cfg = StrategyConfig {
            name: StrategyKind::OvernightRange,
            account_id: "A1".to_string(),
            enabled: true,
            symbols: vec!["MNQ".to_string()],
            position_size: 2.0,
            max_positions: 1,
            params: StrategyParams::default(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StrategyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.account_id, "A1");
        assert_eq!(back.symbols, vec!["MNQ".to_string()]);
        assert!((back.params.stop_atr_multiplier - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"name":"OvernightRange","account_id":"A1"}"#;
        let cfg: StrategyConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.max_positions, 1);
        assert_eq!(cfg.params.atr_period, 14);
    }
}
