use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::StageError;

/// Process-wide request budget for the reasoning service, shared by every
/// concurrent run. A fixed number of tokens per time window; a caller whose
/// turn exceeds the budget waits for the window to reset, up to `max_wait`,
/// then fails with `RateLimited`.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<Window>,
}

struct Window {
    started: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Take one token, waiting for a window reset when exhausted.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), StageError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.started) >= self.window {
                    state.started = now;
                    state.used = 0;
                }
                if state.used < self.max_requests {
                    state.used += 1;
                    return Ok(());
                }
                self.window - now.duration_since(state.started)
            };
            if Instant::now() + wait > deadline {
                return Err(StageError::RateLimited(format!(
                    "reasoning-service budget exhausted, next window in {:?}",
                    wait
                )));
            }
            tokio::time::sleep(wait).await;
        }
    }
}
