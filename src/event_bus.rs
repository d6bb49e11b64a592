// =============================================================================
// Event Bus — typed topic fan-out (§4.L)
// =============================================================================
//
// The teacher's `api/ws.rs` pushes a whole `StateSnapshot` whenever
// `AppState::current_state_version()` advances past what a connection last
// saw. That "push on version bump, diff by counter" shape is generalized
// here from one implicit topic to the named topic set of §4.L, each with its
// own monotonic sequence counter instead of one global version.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::{Bar, Notification, Order, Position, RiskSnapshot, StrategyState};

/// Bounded per-subscriber ring buffer. A subscriber lagging past this many
/// frames is treated as slow and must resynchronize via REST (§4.L).
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    AccountUpdate,
    PositionUpdate,
    OrderUpdate,
    TradeFill,
    RiskUpdate,
    Notification,
    MarketUpdate,
    StrategyUpdate,
    MetricsUpdate,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountUpdate => "account_update",
            Self::PositionUpdate => "position_update",
            Self::OrderUpdate => "order_update",
            Self::TradeFill => "trade_fill",
            Self::RiskUpdate => "risk_update",
            Self::Notification => "notification",
            Self::MarketUpdate => "market_update",
            Self::StrategyUpdate => "strategy_update",
            Self::MetricsUpdate => "metrics_update",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::AccountUpdate => 0,
            Self::PositionUpdate => 1,
            Self::OrderUpdate => 2,
            Self::TradeFill => 3,
            Self::RiskUpdate => 4,
            Self::Notification => 5,
            Self::MarketUpdate => 6,
            Self::StrategyUpdate => 7,
            Self::MetricsUpdate => 8,
        }
    }
}

const TOPIC_COUNT: usize = 9;

/// Payload carried on the push stream, matching §6's `{type, data, seq, ts}`
/// frame shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: &'static str,
    pub data: serde_json::Value,
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Any payload the bus can carry. Kept as an enum (rather than pre-serialized
/// JSON at the publish call site) so in-process subscribers — the strategy
/// runtime reacting to `order_update`, say — can match on it directly.
#[derive(Debug, Clone)]
pub enum Event {
    Account(crate::domain::Account),
    Position(Position),
    Order(Order),
    TradeFill(Order),
    Risk(RiskSnapshot),
    Notification(Notification),
    Market(Bar),
    Strategy { account_id: String, state: StrategyState },
    Metrics(serde_json::Value),
}

impl Envelope {
    /// Builds the wire frame for a bus event, serializing its native payload
    /// to JSON. Used by the WS push stream (§6 `/api/stream`).
    pub fn from_event(topic: Topic, seq: u64, event: &Event) -> Self {
        let data = match event {
            Event::Account(a) => serde_json::to_value(a),
            Event::Position(p) => serde_json::to_value(p),
            Event::Order(o) | Event::TradeFill(o) => serde_json::to_value(o),
            Event::Risk(r) => serde_json::to_value(r),
            Event::Notification(n) => serde_json::to_value(n),
            Event::Market(b) => serde_json::to_value(b),
            Event::Strategy { account_id, state } => {
                serde_json::to_value(serde_json::json!({ "account_id": account_id, "state": state }))
            }
            Event::Metrics(v) => Ok(v.clone()),
        }
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to serialize event payload");
            serde_json::Value::Null
        });

        Self { topic: topic.as_str(), data, seq, ts: chrono::Utc::now() }
    }
}

/// One broadcast lane per topic plus a monotonic per-topic sequence counter.
/// Grounded on `app_state.rs`'s `increment_version`/`current_state_version`
/// pair, split across nine named lanes instead of one.
pub struct EventBus {
    lanes: [broadcast::Sender<(u64, Event)>; TOPIC_COUNT],
    seqs: [AtomicU64; TOPIC_COUNT],
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let lanes = std::array::from_fn(|_| broadcast::channel(TOPIC_CAPACITY).0);
        let seqs = std::array::from_fn(|_| AtomicU64::new(0));
        Arc::new(Self { lanes, seqs })
    }

    /// Publishes `event` on `topic`, assigning it the topic's next sequence
    /// number. Publishing never blocks: a full lane just drops its oldest
    /// buffered frame, per `tokio::sync::broadcast` semantics, and the
    /// eventual lagged subscriber is treated as slow (§4.L).
    pub fn publish(&self, topic: Topic, event: Event) -> u64 {
        let seq = self.seqs[topic.index()].fetch_add(1, Ordering::SeqCst) + 1;
        // A send error only means there are currently no subscribers; the
        // event is simply not delivered, which is fine for a push-only bus.
        let _ = self.lanes[topic.index()].send((seq, event));
        seq
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription { topic, rx: self.lanes[topic.index()].subscribe() }
    }

    pub fn current_seq(&self, topic: Topic) -> u64 {
        self.seqs[topic.index()].load(Ordering::SeqCst)
    }
}

/// A subscriber's receive end for one topic. `next()` surfaces lag as a
/// dropped-subscriber signal instead of silently skipping frames, per §4.L's
/// "slow subscribers are dropped and must resynchronize via REST" rule.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<(u64, Event)>,
}

impl Subscription {
    /// Awaits the next event. Returns `Lagged` once if the subscriber fell
    /// behind; the caller should resynchronize via REST before continuing to
    /// read, matching §4.L.
    pub async fn recv(&mut self) -> RecvRes {
        match self.rx.recv().await {
            Ok((seq, event)) => RecvRes::Event { seq, event },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(topic = self.topic.as_str(), skipped, "subscriber lagged, must resync via REST");
                RecvRes::Lagged { skipped }
            }
            Err(broadcast::error::RecvError::Closed) => RecvRes::Closed,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

pub enum RecvRes {
    Event { seq: u64, event: Event },
    Lagged { skipped: u64 },
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LimitSnapshot, NotificationLevel};

    fn notification() -> Notification {
        Notification {
            account_id: "A1".to_string(),
            id: "n1".to_string(),
            timestamp: chrono::Utc::now(),
            level: NotificationLevel::Info,
            message: "hello".to_string(),
            meta: serde_json::json!({}),
        }
    }

    fn risk_snapshot() -> RiskSnapshot {
        RiskSnapshot {
            account_id: "A1".to_string(),
            balance: 50_000.0,
            start_balance: 50_000.0,
            total_pnl: 0.0,
            dll: LimitSnapshot::new(1000.0, 0.0),
            mll: LimitSnapshot::new(2000.0, 0.0),
            trailing_loss: 0.0,
            compliance: true,
            events: Vec::new(),
        }
    }

    #[test]
    fn publish_assigns_increasing_per_topic_sequence() {
        let bus = EventBus::new();
        let s1 = bus.publish(Topic::Notification, Event::Notification(notification()));
        let s2 = bus.publish(Topic::Notification, Event::Notification(notification()));
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        // A different topic's sequence is independent.
        let s3 = bus.publish(Topic::RiskUpdate, Event::Risk(risk_snapshot()));
        assert_eq!(s3, 1);
    }

    #[test]
    fn envelope_from_event_carries_topic_and_seq() {
        let envelope = Envelope::from_event(Topic::Notification, 7, &Event::Notification(notification()));
        assert_eq!(envelope.topic, "notification");
        assert_eq!(envelope.seq, 7);
        assert_eq!(envelope.data["message"], "hello");
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Notification);
        bus.publish(Topic::Notification, Event::Notification(notification()));
        match sub.recv().await {
            RecvRes::Event { seq, .. } => assert_eq!(seq, 1),
            _ => panic!("expected an event"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_lag_instead_of_silently_skipping() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Notification);
        for _ in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(Topic::Notification, Event::Notification(notification()));
        }
        match sub.recv().await {
            RecvRes::Lagged { skipped } => assert!(skipped > 0),
            RecvRes::Event { .. } => panic!("expected Lagged, got an event"),
            RecvRes::Closed => panic!("expected Lagged, got Closed"),
        }
    }
}
