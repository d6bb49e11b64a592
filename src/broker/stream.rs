// =============================================================================
// Broker streaming hub client (§4.D)
// =============================================================================
//
// Generalized from `market_data/candle_buffer.rs::run_kline_stream`: the
// teacher connects to one Binance kline WebSocket per (symbol, interval) and
// returns on any error for the caller to reconnect after a fixed sleep. This
// client instead multiplexes quotes/trades/depth/orders/positions/accounts
// over a single hub connection, tracks a state machine
// (DISCONNECTED -> CONNECTING -> CONNECTED -> SUBSCRIBED <-> RECONNECTING),
// detects per-topic sequence gaps, and applies capped exponential backoff
// instead of the teacher's flat 5s retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub topic: String,
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// Per-topic last-seen sequence number, used to detect gaps that demand a
/// REST reconciliation pass rather than silently trusting the stream.
#[derive(Default)]
struct TopicSeqTracker {
    last_seq: HashMap<String, u64>,
}

impl TopicSeqTracker {
    /// Returns `true` if this event is in-order, `false` if a gap was
    /// detected (caller should trigger reconciliation).
    fn observe(&mut self, topic: &str, seq: u64) -> bool {
        match self.last_seq.get(topic) {
            Some(&last) if seq > last + 1 => {
                self.last_seq.insert(topic.to_string(), seq);
                false
            }
            _ => {
                self.last_seq.insert(topic.to_string(), seq);
                true
            }
        }
    }
}

pub struct BrokerStreamClient {
    url: String,
    topics: Vec<String>,
    state: Arc<RwLock<HubState>>,
    events_tx: broadcast::Sender<HubEvent>,
    /// Fires with the topic name whenever a sequence gap is detected, so the
    /// caller can trigger a targeted REST reconciliation.
    gaps_tx: broadcast::Sender<String>,
    last_heartbeat_ms: Arc<AtomicU64>,
}

impl BrokerStreamClient {
    pub fn new(url: impl Into<String>, topics: Vec<String>) -> Self {
        let (events_tx, _) = broadcast::channel(4096);
        let (gaps_tx, _) = broadcast::channel(256);
        Self {
            url: url.into(),
            topics,
            state: Arc::new(RwLock::new(HubState::Disconnected)),
            events_tx,
            gaps_tx,
            last_heartbeat_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> HubState {
        *self.state.read()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_gaps(&self) -> broadcast::Receiver<String> {
        self.gaps_tx.subscribe()
    }

    fn set_state(&self, new_state: HubState) {
        let mut guard = self.state.write();
        if *guard != new_state {
            info!(?new_state, "hub state transition");
            *guard = new_state;
        }
    }

    /// Runs the connect -> subscribe -> read loop forever, reconnecting with
    /// capped exponential backoff on any disconnect. Returns only when
    /// `cancel` fires, draining for up to 2s first.
    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = MIN_BACKOFF;
        let mut seq_tracker = TopicSeqTracker::default();

        loop {
            if *cancel.borrow() {
                return;
            }

            self.set_state(HubState::Connecting);
            match self.connect_once(&mut seq_tracker, &mut cancel).await {
                Ok(()) => {
                    backoff = MIN_BACKOFF;
                }
                Err(err) => {
                    warn!(error = %err, "hub stream disconnected");
                }
            }

            if *cancel.borrow() {
                return;
            }

            self.set_state(HubState::Reconnecting);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_once(
        &self,
        seq_tracker: &mut TopicSeqTracker,
        cancel: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(url = %self.url, "connecting to broker stream hub");
        let (ws_stream, _response) = connect_async(&self.url).await?;
        self.set_state(HubState::Connected);

        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({ "action": "subscribe", "topics": self.topics });
        write.send(Message::Text(sub_msg.to_string())).await?;
        self.set_state(HubState::Subscribed);
        self.touch_heartbeat();

        let mut watchdog = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.touch_heartbeat();
                            match parse_hub_event(&text) {
                                Ok(event) => {
                                    if !seq_tracker.observe(&event.topic, event.seq) {
                                        warn!(topic = %event.topic, seq = event.seq, "sequence gap detected");
                                        let _ = self.gaps_tx.send(event.topic.clone());
                                    }
                                    let _ = self.events_tx.send(event);
                                }
                                Err(e) => debug!(error = %e, "failed to parse hub event"),
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            self.touch_heartbeat();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = watchdog.tick() => {
                    if self.heartbeat_age() > HEARTBEAT_TIMEOUT {
                        error!("hub heartbeat watchdog expired");
                        anyhow::bail!("heartbeat timeout");
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        let _ = tokio::time::timeout(DRAIN_TIMEOUT, write.close()).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Release);
    }

    fn heartbeat_age(&self) -> Duration {
        let last = self.last_heartbeat_ms.load(Ordering::Acquire);
        let elapsed_ms = now_ms().saturating_sub(last);
        Duration::from_millis(elapsed_ms)
    }
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

fn now_ms() -> u64 {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

fn parse_hub_event(text: &str) -> anyhow::Result<HubEvent> {
    let event: HubEvent = serde_json::from_str(text)?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_tracker_detects_gap() {
        let mut tracker = TopicSeqTracker::default();
        assert!(tracker.observe("quotes.ES", 1));
        assert!(tracker.observe("quotes.ES", 2));
        assert!(!tracker.observe("quotes.ES", 5));
    }

    #[test]
    fn seq_tracker_is_per_topic() {
        let mut tracker = TopicSeqTracker::default();
        assert!(tracker.observe("quotes.ES", 10));
        assert!(tracker.observe("quotes.NQ", 1));
    }

    #[test]
    fn parses_hub_event_json() {
        let json = r#"{"topic":"orders.acct1","seq":3,"payload":{"status":"Filled"}}"#;
        let event = parse_hub_event(json).unwrap();
        assert_eq!(event.topic, "orders.acct1");
        assert_eq!(event.seq, 3);
    }

    #[test]
    fn initial_state_is_disconnected() {
        let client = BrokerStreamClient::new("wss://example.test/hub", vec!["quotes.ES".into()]);
        assert_eq!(client.state(), HubState::Disconnected);
    }
}
