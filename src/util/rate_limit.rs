//! Rate limiting utilities

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

/// Inbound WebSocket messages per session
pub const SESSION_MESSAGE_LIMIT: u32 = 10; // Max 10 messages per second

/// Matchmaking enqueue rate limit
pub const MATCHMAKING_RATE_LIMIT: u32 = 2; // Max 2 enqueue attempts per second

/// Per-session rate limiter state
#[derive(Clone)]
pub struct SessionRateLimiter {
    message_limiter: Arc<Limiter>,
    enqueue_limiter: Arc<Limiter>,
}

impl SessionRateLimiter {
    pub fn new() -> Self {
        Self {
            message_limiter: create_limiter(SESSION_MESSAGE_LIMIT),
            enqueue_limiter: create_limiter(MATCHMAKING_RATE_LIMIT),
        }
    }

    /// Check if an inbound message is allowed (returns true if allowed)
    pub fn check_message(&self) -> bool {
        self.message_limiter.check().is_ok()
    }

    /// Check if an enqueue attempt is allowed
    pub fn check_enqueue(&self) -> bool {
        self.enqueue_limiter.check().is_ok()
    }
}

impl Default for SessionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_burst_is_limited() {
        let limiter = SessionRateLimiter::new();

        let allowed = (0..10).filter(|_| limiter.check_enqueue()).count();
        assert!(allowed >= 1);
        assert!(allowed <= MATCHMAKING_RATE_LIMIT as usize);
    }
}
