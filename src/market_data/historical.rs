// =============================================================================
// Historical Data Service — three-tier bar cache (§4.F)
// =============================================================================
//
// Grounded on the teacher's `CandleBuffer` buffer-then-fetch shape, extended
// with the durable `Store` tier and a fingerprint-keyed single-flight
// (modeled on `binance/rate_limit.rs`'s atomic bookkeeping style) so that
// concurrent callers requesting the same `(symbol, timeframe, range)` share
// one upstream fetch instead of hammering the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::broker::BrokerClient;
use crate::domain::{Bar, Timeframe};
use crate::error::EngineError;
use crate::store::Store;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    start: i64,
    end: i64,
}

struct CacheEntry {
    bars: Vec<Bar>,
    inserted_at: Instant,
}

pub struct HistoricalDataService {
    broker: Arc<BrokerClient>,
    store: Arc<Store>,
    lru: Mutex<HashMap<CacheKey, CacheEntry>>,
    /// One lock per in-flight fingerprint; collapses duplicate concurrent
    /// requests for the same range into a single upstream fetch.
    inflight: AsyncMutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
    ttl_rth: Duration,
    ttl_off: Duration,
}

impl HistoricalDataService {
    pub fn new(broker: Arc<BrokerClient>, store: Arc<Store>, ttl_rth_secs: u64, ttl_off_secs: u64) -> Self {
        Self {
            broker,
            store,
            lru: Mutex::new(HashMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
            ttl_rth: Duration::from_secs(ttl_rth_secs),
            ttl_off: Duration::from_secs(ttl_off_secs),
        }
    }

    fn ttl(&self, during_rth: bool) -> Duration {
        if during_rth {
            self.ttl_rth
        } else {
            self.ttl_off
        }
    }

    /// Resolve bars for `(symbol, timeframe, [start,end])` via the three-tier
    /// lookup order from §4.F: in-memory LRU, then durable store, then
    /// broker REST for any remaining gap.
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
        during_rth: bool,
        limit: usize,
    ) -> Result<Vec<Bar>, EngineError> {
        let key = CacheKey { symbol: symbol.to_string(), timeframe, start, end };

        if let Some(bars) = self.lru_lookup(&key, during_rth) {
            return Ok(clamp(bars, limit));
        }

        let lock = self.fingerprint_lock(key.clone()).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the fingerprint lock: another task may
        // have already populated the cache while we were waiting.
        if let Some(bars) = self.lru_lookup(&key, during_rth) {
            return Ok(clamp(bars, limit));
        }

        let tf_unit = timeframe.unit.as_str();
        let from_store = self
            .store
            .load_bars(symbol, timeframe.value, tf_unit, start, end, limit)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let rows = if covers_range_rows(&from_store, start, end) {
            from_store
        } else {
            debug!(symbol, start, end, "historical cache miss, fetching from broker");
            let fetched = self
                .broker
                .get_historical_bars(symbol, &timeframe.to_string(), start, end)
                .await?;

            self.store
                .upsert_bars(symbol, timeframe.value, tf_unit, &fetched)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            fetched
        };

        let bars: Vec<Bar> = rows
            .into_iter()
            .map(|(open_time, open, high, low, close, volume)| Bar {
                symbol: symbol.to_string(),
                timeframe,
                open_time: Utc.timestamp_opt(open_time, 0).single().unwrap_or_else(Utc::now),
                open,
                high,
                low,
                close,
                volume,
            })
            .collect();

        let sorted = sort_dedup(bars);
        self.lru.lock().insert(key, CacheEntry { bars: sorted.clone(), inserted_at: Instant::now() });
        Ok(clamp(sorted, limit))
    }

    fn lru_lookup(&self, key: &CacheKey, during_rth: bool) -> Option<Vec<Bar>> {
        let guard = self.lru.lock();
        let entry = guard.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl(during_rth) {
            Some(entry.bars.clone())
        } else {
            None
        }
    }

    async fn fingerprint_lock(&self, key: CacheKey) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// Row-level coverage check against the raw store tuples, before they are
/// promoted to `Bar`s.
fn covers_range_rows(rows: &[(i64, f64, f64, f64, f64, f64)], start: i64, end: i64) -> bool {
    if rows.is_empty() {
        return false;
    }
    rows.first().map(|r| r.0 <= start).unwrap_or(false) && rows.last().map(|r| r.0 >= end).unwrap_or(false)
}

fn sort_dedup(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.open_time);
    bars.dedup_by_key(|b| b.open_time);
    bars
}

fn clamp(mut bars: Vec<Bar>, limit: usize) -> Vec<Bar> {
    if bars.len() > limit {
        let start = bars.len() - limit;
        bars = bars.split_off(start);
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            symbol: "ES".into(),
            timeframe: Timeframe::minutes(5),
            open_time: Utc.timestamp_opt(open_time, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn sort_dedup_removes_duplicates_and_orders() {
        let bars = vec![bar(300, 1.0), bar(0, 1.0), bar(0, 2.0)];
        let result = sort_dedup(bars);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].open_time.timestamp(), 0);
        assert_eq!(result[1].open_time.timestamp(), 300);
    }

    #[test]
    fn clamp_keeps_most_recent() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, 1.0)).collect();
        let clamped = clamp(bars, 2);
        assert_eq!(clamped.len(), 2);
        assert_eq!(clamped[0].open_time.timestamp(), 3);
        assert_eq!(clamped[1].open_time.timestamp(), 4);
    }

    #[test]
    fn covers_range_requires_both_ends() {
        let rows = vec![(10_i64, 1.0, 1.0, 1.0, 1.0, 1.0)];
        assert!(!covers_range_rows(&rows, 0, 20));
        assert!(covers_range_rows(&rows, 10, 10));
    }
}
