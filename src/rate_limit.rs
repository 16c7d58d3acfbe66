//! Request-rate limiting for the monitor HTTP surface, `governor`-based.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute.max(1)).unwrap());
        RateLimitState { limiter: Arc::new(RateLimiter::direct(quota)) }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_MINUTE)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(state): axum::extract::State<Arc<RateLimitState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.limiter.check().is_err() {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_quota() {
        let state = RateLimitState::new(60);
        assert!(state.limiter.check().is_ok());
    }

    #[test]
    fn blocks_once_burst_quota_is_exhausted() {
        let state = RateLimitState::new(1);
        assert!(state.limiter.check().is_ok());
        assert!(state.limiter.check().is_err());
    }
}
