//! Time-ordered reconnect scheduling with quadratic backoff.
//!
//! # Design
//! Deadlines are monotonic [`Instant`]s, keyed `(deadline, seq)` so that
//! entries sharing a deadline stay distinct and drain FIFO (a plain
//! `deadline → node` map would silently overwrite colliding deadlines).
//!
//! Every entry point takes `now` explicitly instead of reading the clock,
//! which keeps the schedule deterministic under test: the loop passes
//! `Instant::now()`, tests pass whatever they like.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Backoff before reconnect attempt number `attempt` (1-based):
/// `(unit_ms * attempt)^2` milliseconds, clamped to `max`.
///
/// With the production unit of 100ms that is 10s for the first retry and
/// the 30s ceiling from the second onward.
pub(crate) fn backoff_delay(attempt: u32, unit_ms: u64, max: Duration) -> Duration {
    let base = unit_ms.saturating_mul(u64::from(attempt));
    let millis = base.saturating_mul(base);
    Duration::from_millis(millis).min(max)
}

/// Nodes awaiting reconnect, ordered by eligibility time.
pub(crate) struct ReconnectSchedule {
    by_deadline: BTreeMap<(Instant, u64), usize>,
    seq: u64,
}

impl ReconnectSchedule {
    pub(crate) fn new() -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_deadline.len()
    }

    /// Registers `node` for a reconnect attempt at `deadline`.
    pub(crate) fn schedule(&mut self, deadline: Instant, node: usize) {
        let seq = self.seq;
        self.seq += 1;
        self.by_deadline.insert((deadline, seq), node);
    }

    /// How long the poller may sleep before the earliest deadline.
    ///
    /// `None` when nothing is scheduled; otherwise at least one millisecond
    /// so a deadline in the past still yields a bounded, non-zero wait.
    pub(crate) fn select_timeout(&self, now: Instant) -> Option<Duration> {
        let (&(deadline, _), _) = self.by_deadline.iter().next()?;
        Some(
            deadline
                .saturating_duration_since(now)
                .max(Duration::from_millis(1)),
        )
    }

    /// Removes and returns every node whose deadline is at or before `now`,
    /// in schedule order.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some((&(deadline, seq), &node)) = self.by_deadline.iter().next() {
            if deadline > now {
                break;
            }
            self.by_deadline.remove(&(deadline, seq));
            due.push(node);
        }
        due
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, node: usize) -> bool {
        self.by_deadline.values().any(|&n| n == node)
    }
}
