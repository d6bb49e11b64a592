pub mod bar_aggregator;
pub mod historical;

pub use bar_aggregator::{BarAggregator, BarEvent};
pub use historical::HistoricalDataService;
