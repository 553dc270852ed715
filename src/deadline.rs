//! Deadlines for cancellable reads
//!
//! `scan` and `search` stop early when their deadline passes and report a
//! truncated result instead of an error.

use std::time::{Duration, Instant};

/// Point in time after which a read returns what it has so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Deadline at an absolute instant
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// `true` when an optional deadline exists and has passed
pub(crate) fn is_expired(deadline: Option<&Deadline>) -> bool {
    deadline.map_or(false, Deadline::expired)
}
