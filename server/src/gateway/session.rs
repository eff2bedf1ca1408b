//! Per-session helpers: inbound rate limiting and the reconnect transport

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::realtime::{EventRouter, RealtimeError, ReconnectTransport};

/// Fixed window counter for inbound frames
///
/// Window boundaries allow up to twice the limit across two adjacent
/// windows; acceptable for frame throttling.
pub struct FrameRateLimiter {
    window: Duration,
    max: u32,
    window_start: Instant,
    count: u32,
}

impl FrameRateLimiter {
    pub fn new(window_ms: u64, max: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            max,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Count one frame; false means the session is over its budget
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.max
    }
}

/// Reconnect seam backed by the router's sink registry
///
/// A reconnection attempt succeeds exactly when the client has re-attached
/// a socket for the session (a fresh sink with a live writer). There is no
/// simulated outcome: until the client actually comes back, attempts fail
/// and the backoff schedule runs its course.
pub struct GatewayReconnectTransport {
    router: EventRouter,
}

impl GatewayReconnectTransport {
    pub fn new(router: EventRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl ReconnectTransport for GatewayReconnectTransport {
    async fn attempt(&self, session_id: &str) -> Result<(), RealtimeError> {
        if self.router.has_live_sink(session_id) {
            Ok(())
        } else {
            Err(RealtimeError::TransportUnavailable(session_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_boundary() {
        let mut limiter = FrameRateLimiter::new(60_000, 3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_resets() {
        let mut limiter = FrameRateLimiter::new(1_000, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.allow());
    }
}
