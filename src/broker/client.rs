// =============================================================================
// Broker REST Client (§4.C)
// =============================================================================
//
// Generalized from the teacher's `binance/client.rs`: that client signed
// every request with an HMAC-SHA256 API secret and carried no token
// lifecycle. TopStepX-style prop brokers instead exchange
// username+API-key for a short-lived bearer session token, so the signing
// step is replaced with a refreshable-token mutex, but the request shape
// (reqwest::Client with default headers, `#[instrument]`-free structured
// tracing, secret-redacting Debug impl) is carried over directly.

use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::domain::{Contract, Order, Position};
use crate::error::EngineError;

use super::rate_limit::RateLimiter;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BASE_MS: u64 = 750;
const RETRY_FACTOR: f64 = 2.0;
const MAX_RETRIES: u32 = 3;

/// Session token plus the wall-clock instant it was minted and its declared
/// lifetime, so the client can proactively refresh at ≥80% of lifetime.
struct Session {
    token: String,
    minted_at: Instant,
    lifetime: Duration,
}

impl Session {
    fn should_refresh(&self) -> bool {
        self.minted_at.elapsed() >= self.lifetime.mul_f64(0.8)
    }
}

pub struct BrokerClient {
    base_url: String,
    username: String,
    api_key: String,
    http: Client,
    session: AsyncMutex<Option<Session>>,
    rate_limiter: RateLimiter,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: String,
    pub reduce_only: bool,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    #[serde(default = "default_lifetime_secs")]
    expires_in_secs: u64,
}

fn default_lifetime_secs() -> u64 {
    3600
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(RECV_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            username: username.into(),
            api_key: api_key.into(),
            http,
            session: AsyncMutex::new(None),
            rate_limiter: RateLimiter::new(30, 30),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Acquire a valid bearer token, refreshing if absent or ≥80% expired. A
    /// single mutex serializes refresh attempts; concurrent callers await the
    /// in-flight refresh rather than issuing duplicate auth calls.
    async fn token(&self) -> Result<String, EngineError> {
        let mut guard = self.session.lock().await;
        let needs_refresh = match guard.as_ref() {
            Some(session) => session.should_refresh(),
            None => true,
        };

        if needs_refresh {
            let auth: AuthResponse = self
                .http
                .post(self.url("/api/auth/session"))
                .json(&serde_json::json!({ "userName": self.username, "apiKey": self.api_key }))
                .send()
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?
                .error_for_status()
                .map_err(|_| EngineError::AuthExpired)?
                .json()
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;

            info!("broker session token refreshed");
            *guard = Some(Session {
                token: auth.token,
                minted_at: Instant::now(),
                lifetime: Duration::from_secs(auth.expires_in_secs),
            });
        }

        Ok(guard.as_ref().expect("session set above").token.clone())
    }

    /// Retry wrapper for idempotent reads: up to 3 attempts, exponential
    /// backoff base 750ms factor 2, jitter ±20%, only on `Transient`.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff_ms = (RETRY_BASE_MS as f64 * RETRY_FACTOR.powi(attempt as i32)) as u64;
                    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
                    let delay = Duration::from_millis((backoff_ms as f64 * (1.0 + jitter)).max(0.0) as u64);
                    warn!(attempt, ?delay, error = %err, "retrying broker request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn classify_status(status: StatusCode) -> EngineError {
        if status == StatusCode::UNAUTHORIZED {
            EngineError::AuthExpired
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            EngineError::RateLimited
        } else if status.is_server_error() {
            EngineError::Transient(format!("http {status}"))
        } else {
            EngineError::BrokerRejected(format!("http {status}"))
        }
    }

    pub async fn authenticate(&self) -> Result<(), EngineError> {
        self.token().await.map(|_| ())
    }

    pub async fn list_accounts(&self) -> Result<Vec<crate::domain::Account>, EngineError> {
        self.with_retry(|| self.get_json("/api/accounts")).await
    }

    pub async fn get_contract(&self, symbol: &str) -> Result<Contract, EngineError> {
        self.with_retry(|| self.get_json(&format!("/api/contracts/{symbol}"))).await
    }

    pub async fn list_contracts(&self) -> Result<Vec<Contract>, EngineError> {
        self.with_retry(|| self.get_json("/api/contracts")).await
    }

    pub async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, EngineError> {
        self.with_retry(|| self.get_json(&format!("/api/positions?accountId={account_id}")))
            .await
    }

    pub async fn get_orders(&self, account_id: &str) -> Result<Vec<Order>, EngineError> {
        self.with_retry(|| self.get_json(&format!("/api/orders?accountId={account_id}")))
            .await
    }

    /// Writes only retry on 5xx when an idempotency key is present (§4.C).
    pub async fn place_order(&self, req: &OrderRequest) -> Result<Order, EngineError> {
        if !self.rate_limiter.try_acquire() {
            return Err(EngineError::RateLimited);
        }

        let attempt = || self.post_json::<Order, _>("/api/orders", req);
        if req.idempotency_key.is_some() {
            self.with_retry(attempt).await
        } else {
            attempt().await
        }
        .inspect(|_| self.rate_limiter.record_order_sent())
    }

    pub async fn modify_order(&self, id: &str, price: Option<f64>, qty: Option<f64>) -> Result<Order, EngineError> {
        let body = serde_json::json!({ "price": price, "quantity": qty });
        self.post_json(&format!("/api/orders/{id}/modify"), &body).await
    }

    pub async fn cancel_order(&self, id: &str) -> Result<(), EngineError> {
        self.delete(&format!("/api/orders/{id}")).await
    }

    pub async fn cancel_all_for_account(&self, account_id: &str) -> Result<(), EngineError> {
        self.delete(&format!("/api/orders?accountId={account_id}")).await
    }

    pub async fn flatten_symbol(&self, account_id: &str, symbol: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "accountId": account_id, "symbol": symbol });
        self.post_json::<serde_json::Value, _>("/api/positions/flatten", &body)
            .await
            .map(|_| ())
    }

    pub async fn get_historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start_unix: i64,
        end_unix: i64,
    ) -> Result<Vec<(i64, f64, f64, f64, f64, f64)>, EngineError> {
        let path = format!(
            "/api/history/bars?symbol={symbol}&timeframe={timeframe}&start={start_unix}&end={end_unix}"
        );
        self.with_retry(|| self.get_json_timeout(&path, HISTORY_TIMEOUT)).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        self.get_json_timeout(path, RECV_TIMEOUT).await
    }

    async fn get_json_timeout<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, EngineError> {
        let token = self.token().await?;
        debug!(path, "broker GET");
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Transient(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        resp.json().await.map_err(|e| EngineError::Internal(e.to_string()))
    }

    async fn post_json<T: serde::de::DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, EngineError> {
        let token = self.token().await?;
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .timeout(RECV_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        resp.json().await.map_err(|e| EngineError::Internal(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), EngineError> {
        let token = self.token().await?;
        let resp = self
            .http
            .delete(self.url(path))
            .bearer_auth(token)
            .timeout(RECV_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_impl_redacts_api_key() {
        let client = BrokerClient::new("https://example.test", "trader1", "supersecret");
        let debug = format!("{client:?}");
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("<redacted>"));
    }
}
