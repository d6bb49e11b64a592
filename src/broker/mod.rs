// =============================================================================
// Broker adapter — REST client (§4.C) + streaming hub client (§4.D)
// =============================================================================

mod client;
mod rate_limit;
mod stream;

pub use client::{BrokerClient, OrderRequest};
pub use rate_limit::RateLimiter;
pub use stream::{BrokerStreamClient, HubEvent, HubState};
