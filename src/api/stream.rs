// =============================================================================
// WebSocket push stream (§6 `/api/stream`)
// =============================================================================
//
// Grounded on the teacher's `api/ws.rs`: an Axum upgrade handler gated by
// `validate_token`, a `tokio::select!` loop mixing outbound pushes with
// inbound Ping/Close handling, one task per connection. The teacher polled
// a single `state_version` counter every 500ms; here each topic already has
// its own `broadcast` channel via `EventBus`, so the push side becomes one
// `select!` arm per topic subscription instead of a poll interval.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::context::CoreContext;
use crate::event_bus::{Envelope, RecvRes, Topic};

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("stream connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("stream connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx)).into_response()
}

const TOPICS: [Topic; 9] = [
    Topic::AccountUpdate,
    Topic::PositionUpdate,
    Topic::OrderUpdate,
    Topic::TradeFill,
    Topic::RiskUpdate,
    Topic::Notification,
    Topic::MarketUpdate,
    Topic::StrategyUpdate,
    Topic::MetricsUpdate,
];

async fn handle_connection(socket: WebSocket, ctx: Arc<CoreContext>) {
    let (mut sender, mut receiver) = socket.split();

    let mut subs: Vec<_> = TOPICS.iter().map(|&t| ctx.events.subscribe(t)).collect();

    loop {
        tokio::select! {
            biased;

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("stream Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "stream receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }

            (idx, res) = next_ready(&mut subs) => {
                match res {
                    RecvRes::Event { seq, event } => {
                        let envelope = Envelope::from_event(TOPICS[idx], seq, &event);
                        match serde_json::to_string(&envelope) {
                            Ok(json) => {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize stream envelope"),
                        }
                    }
                    RecvRes::Lagged { skipped } => {
                        debug!(topic = %TOPICS[idx].as_str(), skipped, "stream subscriber lagged, client must resync via REST");
                    }
                    RecvRes::Closed => break,
                }
            }
        }
    }

    info!("stream connection closed");
}

/// Polls every subscription and returns the first ready one, paired with its
/// index into `TOPICS`. Used instead of a fixed-arity `select!` since the
/// topic count is a compile-time array, not nine hand-written arms.
async fn next_ready(subs: &mut [crate::event_bus::Subscription]) -> (usize, RecvRes) {
    use futures_util::future::{select_all, BoxFuture};
    let futures: Vec<BoxFuture<'_, RecvRes>> = subs.iter_mut().map(|s| Box::pin(s.recv()) as BoxFuture<'_, RecvRes>).collect();
    let (res, idx, _rest) = select_all(futures).await;
    (idx, res)
}
