// =============================================================================
// Tick -> bar aggregation (§4.E)
// =============================================================================
//
// Grounded on the teacher's `CandleBuffer` (ring buffer + in-progress-candle
// replacement), generalized from a passive ring buffer fed by an external
// kline parser into an active aggregator that owns boundary computation: each
// incoming quote is folded into the current bar, and elapsed boundaries
// (including gaps with no ticks) are filled forward per §4.E step 1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::{Bar, Quote, Timeframe};

const COALESCE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum BarEvent {
    Updated(Bar),
    Closed(Bar),
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SeriesKey {
    symbol: String,
    timeframe: Timeframe,
}

/// Bar-in-progress, keyed internally by unix-seconds `open_time` (boundary
/// arithmetic is simplest in integer seconds); converted to `Bar`'s
/// `DateTime<Utc>` only when emitted.
struct PendingBar {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PendingBar {
    fn to_bar(&self, symbol: &str, timeframe: Timeframe) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe,
            open_time: Utc.timestamp_opt(self.open_time, 0).single().unwrap_or_else(Utc::now),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

struct BarBuilder {
    current: Option<PendingBar>,
    next_boundary: i64,
    last_emit: Option<Instant>,
}

impl BarBuilder {
    fn new() -> Self {
        Self { current: None, next_boundary: 0, last_emit: None }
    }
}

/// Maps `(symbol, timeframe) -> BarBuilder` and fans closed/updated bars out
/// to every subscriber of that series via a shared broadcast channel.
pub struct BarAggregator {
    builders: RwLock<HashMap<SeriesKey, BarBuilder>>,
    sinks: RwLock<HashMap<SeriesKey, broadcast::Sender<BarEvent>>>,
}

impl BarAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { builders: RwLock::new(HashMap::new()), sinks: RwLock::new(HashMap::new()) })
    }

    pub fn subscribe(&self, symbol: &str, timeframe: Timeframe) -> broadcast::Receiver<BarEvent> {
        let key = SeriesKey { symbol: symbol.to_string(), timeframe };
        let mut sinks = self.sinks.write();
        let sender = sinks.entry(key).or_insert_with(|| broadcast::channel(256).0);
        sender.subscribe()
    }

    pub fn current_bar(&self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        let key = SeriesKey { symbol: symbol.to_string(), timeframe };
        self.builders.read().get(&key).and_then(|b| b.current.as_ref()).map(|p| p.to_bar(symbol, timeframe))
    }

    /// Boundary policy (§4.E): sub-daily frames align to UTC epoch; daily+
    /// frames align to the configured exchange-session close instead, so the
    /// caller passes that close time in as `session_close_unix` when known.
    fn boundary_for(&self, timeframe: Timeframe, t: i64, session_close_unix: Option<i64>) -> i64 {
        match timeframe.seconds() {
            Some(secs) => ((t / secs) + 1) * secs,
            None => session_close_unix.unwrap_or(t + 86_400),
        }
    }

    /// Feed a single tick into the (symbol, timeframe) series. `session_close_unix`
    /// only matters for daily+ timeframes.
    pub fn on_tick(&self, symbol: &str, timeframe: Timeframe, quote: &Quote, session_close_unix: Option<i64>) {
        let key = SeriesKey { symbol: symbol.to_string(), timeframe };
        let price = quote.price();
        let vol = quote.volume.unwrap_or(0.0);
        let t = quote.timestamp.timestamp();

        let mut builders = self.builders.write();
        let builder = builders.entry(key.clone()).or_insert_with(BarBuilder::new);

        if builder.current.is_none() {
            let boundary = self.boundary_for(timeframe, t, session_close_unix);
            builder.current = Some(new_pending(t, price));
            builder.next_boundary = boundary;
        }

        // Close every elapsed boundary in turn. A boundary whose bar never
        // received a tick closes as a flat fill (open=high=low=close=prev
        // close, volume=0) per §4.E step 1, since the loop always opens the
        // next bar flat and only the final iteration's bar receives the
        // live tick update below.
        while t >= builder.next_boundary {
            let closed = builder.current.take().expect("builder always holds a bar while active");
            self.emit(&key, BarEvent::Closed(closed.to_bar(symbol, timeframe)));

            let open_time = builder.next_boundary;
            builder.next_boundary = self.boundary_for(timeframe, open_time, session_close_unix);
            builder.current = Some(flat_pending(open_time, closed.close));
        }

        if let Some(bar) = builder.current.as_mut() {
            bar.high = bar.high.max(price);
            bar.low = bar.low.min(price);
            bar.close = price;
            bar.volume += vol;

            let should_emit = builder.last_emit.map(|last| last.elapsed() >= COALESCE_WINDOW).unwrap_or(true);
            if should_emit {
                builder.last_emit = Some(Instant::now());
                self.emit(&key, BarEvent::Updated(bar.to_bar(symbol, timeframe)));
            }
        }
    }

    fn emit(&self, key: &SeriesKey, event: BarEvent) {
        let sinks = self.sinks.read();
        if let Some(sender) = sinks.get(key) {
            let _ = sender.send(event);
        }
    }
}

fn new_pending(open_time: i64, price: f64) -> PendingBar {
    PendingBar { open_time, open: price, high: price, low: price, close: price, volume: 0.0 }
}

fn flat_pending(open_time: i64, prev_close: f64) -> PendingBar {
    PendingBar { open_time, open: prev_close, high: prev_close, low: prev_close, close: prev_close, volume: 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(ts: i64, price: f64, vol: f64) -> Quote {
        Quote {
            symbol: "ES".into(),
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            bid: price,
            ask: price,
            last: Some(price),
            volume: Some(vol),
        }
    }

    #[test]
    fn aggregates_ticks_within_one_bar() {
        let agg = BarAggregator::new();
        let tf = Timeframe::minutes(1);
        agg.on_tick("ES", tf, &quote(0, 100.0, 1.0), None);
        agg.on_tick("ES", tf, &quote(10, 105.0, 2.0), None);
        agg.on_tick("ES", tf, &quote(20, 95.0, 1.0), None);

        let bar = agg.current_bar("ES", tf).unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 95.0);
        assert_eq!(bar.close, 95.0);
        assert_eq!(bar.volume, 4.0);
    }

    #[test]
    fn closes_bar_on_boundary_crossing() {
        let agg = BarAggregator::new();
        let tf = Timeframe::minutes(1);
        let mut rx = agg.subscribe("ES", tf);

        agg.on_tick("ES", tf, &quote(0, 100.0, 1.0), None);
        agg.on_tick("ES", tf, &quote(61, 110.0, 1.0), None);

        let mut saw_closed = false;
        while let Ok(event) = rx.try_recv() {
            if let BarEvent::Closed(bar) = event {
                assert_eq!(bar.open_time.timestamp(), 0);
                assert_eq!(bar.close, 100.0);
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[test]
    fn fills_missing_intervals_flat() {
        let agg = BarAggregator::new();
        let tf = Timeframe::minutes(1);
        let mut rx = agg.subscribe("ES", tf);

        agg.on_tick("ES", tf, &quote(0, 100.0, 1.0), None);
        // Jump 3 minutes ahead with no intervening ticks.
        agg.on_tick("ES", tf, &quote(181, 120.0, 1.0), None);

        let mut closed_count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BarEvent::Closed(_)) {
                closed_count += 1;
            }
        }
        assert!(closed_count >= 2, "expected at least one real close plus filled gap bars");
    }
}
