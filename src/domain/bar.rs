use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

/// A bar interval, e.g. 5 minutes or 1 day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    pub value: u32,
    pub unit: TimeframeUnit,
}

impl TimeframeUnit {
    /// Canonical lowercase string used as the durable-store column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl Timeframe {
    pub const fn minutes(value: u32) -> Self {
        Self { value, unit: TimeframeUnit::Minute }
    }

    /// Duration in seconds, for sub-daily boundary alignment. Returns `None`
    /// for day/week/month units, which align to the exchange session close
    /// rather than a fixed epoch modulus.
    pub fn seconds(&self) -> Option<i64> {
        let unit_secs: i64 = match self.unit {
            TimeframeUnit::Second => 1,
            TimeframeUnit::Minute => 60,
            TimeframeUnit::Hour => 3600,
            _ => return None,
        };
        Some(unit_secs * self.value as i64)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            TimeframeUnit::Second => "s",
            TimeframeUnit::Minute => "m",
            TimeframeUnit::Hour => "h",
            TimeframeUnit::Day => "d",
            TimeframeUnit::Week => "w",
            TimeframeUnit::Month => "M",
        };
        write!(f, "{}{}", self.value, unit)
    }
}

/// An OHLCV bar. Uniqueness key is `(symbol, timeframe, open_time)`. A closed
/// bar is immutable once its window ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A live quote or trade tick. Never persisted — only consumed by the bar
/// aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub last: Option<f64>,
    pub volume: Option<f64>,
}

impl Quote {
    /// The representative trade price for bar aggregation: `last` if present,
    /// otherwise the mid of bid/ask.
    pub fn price(&self) -> f64 {
        self.last.unwrap_or((self.bid + self.ask) / 2.0)
    }
}
