// =============================================================================
// Token-bucket rate limiter for the broker REST client (§4.C)
// =============================================================================
//
// Generalized from the teacher's `binance/rate_limit.rs`, which tracked
// Binance's weight-unit headers with atomic counters. TopStepX exposes no
// equivalent header, so this is a local token bucket instead: burst 30,
// refill 30/s by default, configurable per endpoint family.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

pub struct RateLimiter {
    burst: u32,
    refill_per_sec: u32,
    tokens_milli: AtomicI64,
    last_refill_ms: AtomicI64,
    orders_sent: AtomicU32,
}

impl RateLimiter {
    pub fn new(burst: u32, refill_per_sec: u32) -> Self {
        Self {
            burst,
            refill_per_sec,
            tokens_milli: AtomicI64::new(burst as i64 * 1000),
            last_refill_ms: AtomicI64::new(now_millis()),
            orders_sent: AtomicU32::new(0),
        }
    }

    fn refill(&self) {
        let now = now_millis();
        let last = self.last_refill_ms.swap(now, Ordering::AcqRel);
        let elapsed_ms = (now - last).max(0);
        if elapsed_ms == 0 {
            self.last_refill_ms.store(now, Ordering::Release);
            return;
        }
        let added_milli = elapsed_ms * self.refill_per_sec as i64;
        let cap_milli = self.burst as i64 * 1000;
        let mut tokens = self.tokens_milli.load(Ordering::Acquire);
        loop {
            let new_tokens = (tokens + added_milli).min(cap_milli);
            match self
                .tokens_milli
                .compare_exchange_weak(tokens, new_tokens, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => tokens = actual,
            }
        }
    }

    /// Attempt to spend one request's worth of budget. Returns `true` if the
    /// request may proceed.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        let mut tokens = self.tokens_milli.load(Ordering::Acquire);
        loop {
            if tokens < 1000 {
                return false;
            }
            match self
                .tokens_milli
                .compare_exchange_weak(tokens, tokens - 1000, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => tokens = actual,
            }
        }
    }

    pub fn record_order_sent(&self) {
        self.orders_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orders_sent(&self) -> u32 {
        self.orders_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_capacity_is_exhausted_then_refused() {
        let limiter = RateLimiter::new(3, 1);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn order_counter_increments() {
        let limiter = RateLimiter::new(30, 30);
        limiter.record_order_sent();
        limiter.record_order_sent();
        assert_eq!(limiter.orders_sent(), 2);
    }
}
