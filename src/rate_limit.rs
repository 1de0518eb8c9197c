//! Per-connection event throttling.
//!
//! DESIGN
//! ======
//! Minimum-interval gates backed by `HashMap<ConnectionId, HashMap<EventKind, Instant>>`.
//! Each event kind has its own clock, so a burst of cursor moves never eats
//! into the budget for finished strokes. A call inside the interval is
//! rejected and the caller drops the event; nothing is queued or retried.
//!
//! The limiter is owned by the hub task, so it needs no interior locking.
//! A periodic sweep discards entries that have gone stale, which bounds
//! memory for long-lived idle connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::state::ConnectionId;

/// Entries untouched for longer than this are dropped by `sweep`.
pub const STALE_AFTER: Duration = Duration::from_secs(300);

const STROKE_INTERVAL: Duration = Duration::from_millis(50);
const SEGMENT_INTERVAL: Duration = Duration::from_millis(16);
const CURSOR_INTERVAL: Duration = Duration::from_millis(100);
const STATE_REQUEST_INTERVAL: Duration = Duration::from_millis(250);
const RENAME_INTERVAL: Duration = Duration::from_millis(1000);
const STATS_INTERVAL: Duration = Duration::from_millis(1000);

/// Throttled event families. Each one is tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Stroke,
    Segment,
    Cursor,
    StateRequest,
    Rename,
    Stats,
}

impl EventKind {
    /// Minimum spacing between two accepted events of this kind.
    #[must_use]
    pub fn min_interval(self) -> Duration {
        match self {
            Self::Stroke => STROKE_INTERVAL,
            Self::Segment => SEGMENT_INTERVAL,
            Self::Cursor => CURSOR_INTERVAL,
            Self::StateRequest => STATE_REQUEST_INTERVAL,
            Self::Rename => RENAME_INTERVAL,
            Self::Stats => STATS_INTERVAL,
        }
    }
}

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{kind:?} throttled (min interval {interval_ms}ms)")]
pub struct RateLimited {
    pub kind: EventKind,
    pub interval_ms: u128,
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Last accepted timestamp per connection and event kind.
    last_accepted: HashMap<ConnectionId, HashMap<EventKind, Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the event if `min_interval` has elapsed since the last accepted
    /// one of the same kind on this connection. Accepting records `now`.
    pub fn allow(&mut self, connection_id: ConnectionId, kind: EventKind, min_interval: Duration, now: Instant) -> bool {
        let throttles = self.last_accepted.entry(connection_id).or_default();
        if let Some(&last) = throttles.get(&kind) {
            if now.saturating_duration_since(last) < min_interval {
                return false;
            }
        }
        throttles.insert(kind, now);
        true
    }

    /// `allow` with the kind's default interval, as a typed result.
    pub fn check(&mut self, connection_id: ConnectionId, kind: EventKind, now: Instant) -> Result<(), RateLimited> {
        let interval = kind.min_interval();
        if self.allow(connection_id, kind, interval, now) {
            Ok(())
        } else {
            Err(RateLimited { kind, interval_ms: interval.as_millis() })
        }
    }

    /// Drop all throttle state for a connection. Unknown ids are a no-op.
    pub fn forget(&mut self, connection_id: ConnectionId) {
        self.last_accepted.remove(&connection_id);
    }

    /// Discard entries older than `STALE_AFTER`. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        self.last_accepted.retain(|_, throttles| {
            let before = throttles.len();
            throttles.retain(|_, last| now.saturating_duration_since(*last) <= STALE_AFTER);
            dropped += before - throttles.len();
            !throttles.is_empty()
        });
        dropped
    }

    /// Number of connections with live throttle entries.
    #[must_use]
    pub fn tracked_connections(&self) -> usize {
        self.last_accepted.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
