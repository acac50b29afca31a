//! Observability counters for the I/O loop.
//!
//! Counters are plain fields updated on the I/O thread only; a snapshot is
//! taken by copying the struct. There is no metrics pipeline here; callers
//! that want one can poll [`ClusterMux::stats`](crate::ClusterMux::stats)
//! and export however they like.

/// Cumulative I/O-loop counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Completed select calls (including empty ones).
    pub selects: u64,
    /// Selects that produced no node events (waker-only wakeups included).
    pub empty_selects: u64,
    /// Defensive registration sweeps triggered by excessive empty selects.
    pub defensive_sweeps: u64,
    /// Bytes drained from write buffers into sockets.
    pub bytes_written: u64,
    /// Bytes read from sockets into read buffers.
    pub bytes_read: u64,
    /// Operations observed reaching their complete state.
    pub ops_completed: u64,
    /// Connections torn down and scheduled for reconnect.
    pub reconnects: u64,
    /// Protocol errors charged against read operations.
    pub protocol_errors: u64,
}
