//! Per-credential call allowance.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::RateLimitHeaders;

/// One set of API access secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: String,
    token: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bearer token; only the HTTP client should read this.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Remaining calls and reset instant for one credential.
///
/// A call is permitted only while `remaining > 0`. Once `reset_at` passes
/// the allowance is restored to the ceiling.
#[derive(Debug, Clone)]
pub struct RateBudget {
    ceiling: u32,
    window: Duration,
    remaining: u32,
    reset_at: Instant,
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl RateBudget {
    /// A full budget whose window starts now.
    pub fn new(ceiling: u32, window: Duration, now: Instant) -> Self {
        Self {
            ceiling,
            window,
            remaining: ceiling,
            reset_at: now + window,
            min_interval: Duration::ZERO,
            last_call: None,
        }
    }

    /// Space consecutive calls at least `interval` apart.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Budget with explicit state, e.g. restored from a rate-limit probe.
    pub fn with_state(mut self, remaining: u32, reset_at: Instant) -> Self {
        self.remaining = remaining;
        self.reset_at = reset_at;
        self
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Restore the allowance if the window has rolled over.
    pub fn refresh(&mut self, now: Instant) {
        if now >= self.reset_at {
            self.remaining = self.ceiling;
            self.reset_at = now + self.window;
        }
    }

    /// Earliest instant a call could be granted, assuming no refresh is pending.
    pub fn available_at(&self, now: Instant) -> Instant {
        if self.remaining == 0 {
            return self.reset_at.max(now);
        }
        match self.last_call {
            Some(last) => (last + self.min_interval).max(now),
            None => now,
        }
    }

    /// Consume one call if permitted right now.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refresh(now);
        if self.available_at(now) > now {
            return false;
        }
        self.remaining -= 1;
        self.last_call = Some(now);
        true
    }

    /// Adopt the server's view of the budget from response headers.
    pub fn update(&mut self, headers: &RateLimitHeaders, now: Instant, wall_now: DateTime<Utc>) {
        if let Some(limit) = headers.limit {
            if limit > 0 {
                self.ceiling = limit;
            }
        }
        if let Some(reset) = headers.reset_at {
            self.reset_at = instant_for(reset, now, wall_now);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = remaining;
        }
        if let Some(retry_after) = headers.retry_after {
            self.exhaust_until(now + retry_after);
        }
    }

    /// Mark the budget spent until `until` (never earlier than a known reset).
    pub fn exhaust_until(&mut self, until: Instant) {
        self.remaining = 0;
        self.reset_at = self.reset_at.max(until);
    }

    /// Mark the budget spent for one full window.
    pub fn exhaust_for_window(&mut self, now: Instant) {
        self.exhaust_until(now + self.window);
    }
}

/// Translate a wall-clock reset time into a monotonic instant.
pub fn instant_for(reset: DateTime<Utc>, now: Instant, wall_now: DateTime<Utc>) -> Instant {
    match (reset - wall_now).to_std() {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}
