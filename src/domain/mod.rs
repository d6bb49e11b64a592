// =============================================================================
// Domain model — Contract, Account, Position, Order, Bar, Tick/Quote,
// Strategy config/state, trade records, risk snapshots, notifications.
// =============================================================================
//
// These types are the shared currency between every component in §2: the
// broker client decodes into them, the account store projects them, the
// strategy runtime reads and produces them, and the control surface
// serializes them directly to JSON for the dashboard.

mod contract;
mod account;
mod position;
mod order;
mod bar;
mod strategy_config;
mod trade;
mod risk_snapshot;
mod notification;

pub use account::{Account, AccountStatus};
pub use bar::{Bar, Quote, Timeframe, TimeframeUnit};
pub use contract::Contract;
pub use notification::{Notification, NotificationLevel};
pub use order::{BracketRole, Order, OrderSide, OrderStatus, OrderType, TimeInForce};
pub use position::{Position, PositionSide};
pub use risk_snapshot::{LimitSnapshot, RiskSnapshot};
pub use strategy_config::{StrategyConfig, StrategyKind, StrategyParams, StrategyState, StrategyStatus, StrategyStats};
pub use trade::{consolidate_fifo, Fill, TradeRecord};
