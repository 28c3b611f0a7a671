//! Rolling-window rate limiting
//!
//! Keeps a log of recent permit instants and suspends callers until issuing
//! one more permit keeps every rolling window at or under `max_permits`.
//! Server cool-downs (`Retry-After` on 429) pause every caller regardless of
//! local state.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::config::permits_with_headroom;
use crate::metrics;

/// Rolling-window rate limiter shared by all workers
#[derive(Debug)]
pub struct RateLimiter {
    max_permits: usize,
    window: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    issued: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl LimiterState {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.issued.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Proof that a request may be sent now.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    /// When the permit was issued
    pub issued_at: Instant,
    /// How long the caller waited for it
    pub waited: Duration,
}

/// Snapshot of the current rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Oldest permit still inside the window, or now when empty
    pub window_start: Instant,
    /// Permits issued within the window
    pub permits_issued_in_window: usize,
    /// Window length
    pub window_duration: Duration,
    /// Configured ceiling
    pub max_permits: usize,
}

impl RateLimiter {
    /// Create a limiter issuing at most `max_permits` per rolling `window`
    ///
    /// # Arguments
    /// * `max_permits` - Maximum permits per window (values below 1 are raised to 1)
    /// * `window` - Rolling window length
    pub fn new(max_permits: usize, window: Duration) -> Self {
        Self {
            max_permits: max_permits.max(1),
            window,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Create a limiter keeping `fraction` of a documented ceiling as headroom
    pub fn with_headroom(documented_limit: usize, fraction: f64, window: Duration) -> Self {
        Self::new(permits_with_headroom(documented_limit, fraction), window)
    }

    /// Configured ceiling per window
    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Rolling window length
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a permit can be issued without exceeding the window ceiling.
    pub async fn acquire(&self) -> Permit {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                match state.cooldown_until {
                    Some(until) if until > now => Some(until - now),
                    _ => {
                        state.cooldown_until = None;
                        state.evict_expired(now, self.window);
                        if state.issued.len() < self.max_permits {
                            state.issued.push_back(now);
                            None
                        } else {
                            // Front is the oldest permit; it leaves the window at front + window
                            state
                                .issued
                                .front()
                                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                        }
                    }
                }
            };

            match wait {
                None => {
                    let waited = started.elapsed();
                    metrics::record_permit_wait(waited);
                    if waited > Duration::from_millis(100) {
                        debug!(wait_ms = waited.as_millis(), "Rate limit permit acquired after wait");
                    }
                    return Permit {
                        issued_at: Instant::now(),
                        waited,
                    };
                }
                Some(delay) => sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Pause every caller for `duration` from now.
    ///
    /// Cool-downs only ever extend: a shorter value than the active one is ignored.
    pub async fn observe_server_cooldown(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock().await;
        let extended = match state.cooldown_until {
            Some(current) if current >= until => false,
            _ => {
                state.cooldown_until = Some(until);
                true
            }
        };
        if extended {
            warn!(
                cooldown_secs = duration.as_secs_f64(),
                "Server requested cool-down, pausing all requests"
            );
        }
    }

    /// Remaining server cool-down, if one is active
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Snapshot of the current rolling window
    pub async fn snapshot(&self) -> RateLimitWindow {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.evict_expired(now, self.window);
        RateLimitWindow {
            window_start: state.issued.front().copied().unwrap_or(now),
            permits_issued_in_window: state.issued.len(),
            window_duration: self.window,
            max_permits: self.max_permits,
        }
    }
}
