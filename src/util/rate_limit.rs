//! Connection flood limiting
//!
//! This is transport-level protection against raw message floods, applied
//! before any envelope is parsed or validated. Behavioral action-rate
//! tracking (suspicion scoring) lives in the security guard.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max raw envelopes per second accepted from one connection
pub const ENVELOPE_RATE_LIMIT: u32 = 60;

/// Per-connection flood limiter state
#[derive(Clone)]
pub struct ConnectionLimiter {
    envelope_limiter: Arc<Limiter>,
}

impl ConnectionLimiter {
    pub fn new() -> Self {
        Self {
            envelope_limiter: create_limiter(ENVELOPE_RATE_LIMIT),
        }
    }

    /// Check if an inbound envelope is allowed (returns true if allowed)
    pub fn check_envelope(&self) -> bool {
        self.envelope_limiter.check().is_ok()
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new()
    }
}
