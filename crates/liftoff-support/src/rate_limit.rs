//! Per-client request limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use liftoff_common::RateLimitSettings;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Time until the window resets, when rejected.
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    /// A decision that always allows.
    pub const fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            retry_after: None,
        }
    }
}

/// Decides whether a client may issue another request.
pub trait RateLimiter: Send + Sync {
    /// Record one request for `client` and decide.
    fn check(&self, client: &str) -> RateDecision;

    /// Whether this limiter can ever reject.
    fn is_enforcing(&self) -> bool {
        true
    }
}

/// Limiter that never rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _client: &str) -> RateDecision {
        RateDecision::unlimited()
    }

    fn is_enforcing(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Checks between sweeps of elapsed windows.
const PRUNE_INTERVAL: u64 = 256;

/// Fixed window counter keyed by client.
///
/// Elapsed windows are swept every `PRUNE_INTERVAL` checks.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
    checks: AtomicU64,
}

impl FixedWindowLimiter {
    /// Allow `limit` requests per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.requests, settings.window())
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!(dropped, tracked = self.windows.len(), "Pruned rate limit windows");
        }
    }

    /// Number of clients with an open window.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    fn check_at(&self, client: &str, now: Instant) -> RateDecision {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            self.prune_at(now);
        }

        let mut window = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.limit {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(window.started));
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after: Some(retry_after),
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: self.limit - window.count,
            retry_after: None,
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, client: &str) -> RateDecision {
        self.check_at(client, Instant::now())
    }
}
