//! Provider Rate Limiting
//!
//! Pacing for the provider endpoint. Two independent checks gate every
//! admission:
//!
//! - A sliding window: at most `max_per_window` admissions inside the
//!   trailing `window` duration.
//! - A minimum spacing between consecutive admissions.
//!
//! # Design
//!
//! The window check alone is not enough when the allowed count is tiny (two
//! per minute permits two back-to-back calls at the top of each window); the
//! spacing floor smooths that into even pacing. Both checks must pass before
//! an admission is recorded.
//!
//! State lives behind an `Arc<Mutex<_>>` so two brokers holding the same
//! provider key can share one limiter and therefore one quota. With a single
//! drain loop per broker there is at most one waiter per clone, so the
//! compute-release-sleep-recheck loop never spins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Configuration for provider pacing
#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    /// Sliding window duration
    pub window: Duration,
    /// Maximum admissions inside one window
    pub max_per_window: u32,
    /// Minimum gap between consecutive admissions
    pub min_spacing: Duration,
    /// Extra margin added when waiting out a full window
    pub safety_buffer: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 2,
            min_spacing: Duration::from_secs(30),
            safety_buffer: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the window duration
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the per-window admission cap
    #[must_use]
    pub fn with_max_per_window(mut self, max: u32) -> Self {
        self.max_per_window = max;
        self
    }

    /// Set the minimum spacing between admissions
    #[must_use]
    pub fn with_min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    /// Set the safety buffer
    #[must_use]
    pub fn with_safety_buffer(mut self, buffer: Duration) -> Self {
        self.safety_buffer = buffer;
        self
    }
}

/// Admission history, pruned lazily on each check
#[derive(Debug, Default)]
struct WindowState {
    /// Timestamps of recent admissions, oldest first
    admissions: VecDeque<Instant>,
    /// The most recent admission, kept separately because `reset` semantics
    /// differ from window pruning
    last_admission: Option<Instant>,
}

impl WindowState {
    /// Drop timestamps older than the window
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admissions.front() {
            if now.duration_since(oldest) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window rate limiter with a spacing floor
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<WindowState>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(WindowState::default())),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Block until the next request may be issued, then record the admission
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.prune(now, self.config.window);

                match self.required_wait(&state, now) {
                    Some(wait) => wait,
                    None => {
                        state.admissions.push_back(now);
                        state.last_admission = Some(now);
                        return;
                    }
                }
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Compute the wait still owed before an admission, if any
    fn required_wait(&self, state: &WindowState, now: Instant) -> Option<Duration> {
        if state.admissions.len() >= self.config.max_per_window as usize {
            // A zero cap never admits; keep waiting a full window at a time.
            let Some(&oldest) = state.admissions.front() else {
                return Some(self.config.window);
            };
            let elapsed = now.duration_since(oldest);
            let wait = self.config.window.saturating_sub(elapsed) + self.config.safety_buffer;
            return Some(wait);
        }

        if let Some(last) = state.last_admission {
            let since_last = now.duration_since(last);
            if since_last < self.config.min_spacing {
                return Some(self.config.min_spacing - since_last);
            }
        }

        None
    }

    /// Forget all admission history
    ///
    /// Called after a provider-directed backoff: the wait already paid the
    /// debt down, and keeping the old timestamps would double-charge it.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.admissions.clear();
        state.last_admission = None;
    }

    /// Number of admissions currently inside the window
    pub async fn window_occupancy(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune(Instant::now(), self.config.window);
        state.admissions.len()
    }
}
