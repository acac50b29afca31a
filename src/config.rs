//! Multiplexer configuration and tuning constants.

use std::time::Duration;

/// The number of empty selects tolerated before the defensive sweep. It is
/// too easy to write a bug that makes the loop spin; the sweep finds those
/// bugs and often works around them.
pub const EXCESSIVE_EMPTY: u32 = 100;

/// Consecutive protocol errors on one connection before it is recycled.
pub const EXCESSIVE_ERRORS: u32 = 1;

/// Ceiling on the reconnect backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

/// Base of the reconnect backoff: delay is `(unit * attempt)^2` milliseconds.
pub const BACKOFF_UNIT_MS: u64 = 100;

/// Default capacity of each node's read and write staging buffers.
pub const DEFAULT_BUF_SIZE: usize = 16 * 1024;

/// Default event capacity handed to the poller per iteration.
pub const DEFAULT_POLL_CAPACITY: usize = 32;

/// Tunables for [`ClusterMux`](crate::ClusterMux).
///
/// `Default` reproduces the production constants above; tests shrink the
/// backoff and thresholds to keep wall-clock time down.
#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Capacity of each node's read buffer.
    pub read_buf_size: usize,
    /// Capacity of each node's write staging buffer.
    pub write_buf_size: usize,
    /// Event capacity per poll call.
    pub poll_capacity: usize,
    /// Poll timeout when no reconnect deadline is pending. `None` blocks
    /// until the waker fires; shutdown always wakes the poller, so blocking
    /// indefinitely is safe.
    pub idle_poll_timeout: Option<Duration>,
    /// Empty-select tolerance before the defensive registration sweep.
    pub excessive_empty: u32,
    /// Consecutive protocol errors before reconnecting a node.
    pub excessive_errors: u32,
    /// Backoff base: delay is `(backoff_unit_ms * attempt)^2` milliseconds.
    pub backoff_unit_ms: u64,
    /// Backoff ceiling.
    pub max_reconnect_delay: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_buf_size: DEFAULT_BUF_SIZE,
            write_buf_size: DEFAULT_BUF_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            idle_poll_timeout: None,
            excessive_empty: EXCESSIVE_EMPTY,
            excessive_errors: EXCESSIVE_ERRORS,
            backoff_unit_ms: BACKOFF_UNIT_MS,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
        }
    }
}
