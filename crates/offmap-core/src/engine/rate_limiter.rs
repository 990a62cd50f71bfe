//! Token bucket throttle for tile fetching
//!
//! Shared by every region job of an engine so the combined fetch rate
//! stays under the configured tiles-per-second budget.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Longest single sleep while waiting for tokens
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Tile rate limiter using a token bucket
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
}

struct BucketState {
    /// Tokens (tiles) available right now
    tokens: f64,
    /// Tiles per second; None means unlimited
    rate: Option<u64>,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `tiles_per_second` fetches per second
    pub fn new(tiles_per_second: u64) -> Self {
        Self::with_rate(Some(tiles_per_second).filter(|r| *r > 0))
    }

    /// Create a limiter that never throttles
    pub fn unlimited() -> Self {
        Self::with_rate(None)
    }

    fn with_rate(rate: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                // One second worth of burst
                tokens: rate.unwrap_or(0) as f64,
                rate,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Change the rate; `None` or zero disables throttling
    pub async fn set_rate(&self, tiles_per_second: Option<u64>) {
        let mut state = self.state.lock().await;
        state.rate = tiles_per_second.filter(|r| *r > 0);
        if let Some(rate) = state.rate {
            state.tokens = state.tokens.min(rate as f64);
        }
        state.last_refill = Instant::now();
    }

    /// Wait until `tiles` tokens are available and consume them
    pub async fn acquire(&self, tiles: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let Some(rate) = state.rate else {
                    return;
                };

                state.refill(rate);

                // Requests bigger than the bucket are clamped to one second worth
                let wanted = (tiles as f64).min(rate as f64);
                if state.tokens >= wanted {
                    state.tokens -= wanted;
                    return;
                }

                let needed = wanted - state.tokens;
                Duration::from_secs_f64(needed / rate as f64).min(MAX_WAIT)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Consume `tiles` tokens if available without waiting
    pub async fn try_acquire(&self, tiles: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(rate) = state.rate else {
            return true;
        };

        state.refill(rate);
        if state.tokens >= tiles as f64 {
            state.tokens -= tiles as f64;
            true
        } else {
            false
        }
    }
}

impl BucketState {
    fn refill(&mut self, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.001 {
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
            self.last_refill = now;
        }
    }
}
