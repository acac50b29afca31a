//! Single-threaded, non-blocking I/O multiplexer for a pool of connections
//! to a fleet of cache servers.
//!
//! One dedicated I/O thread drives readiness-based reads and writes across
//! every connection from a single poller, multiplexes submitted operations
//! onto per-connection queues, and transparently reconnects failed peers
//! with quadratic backoff while preserving in-flight work (at-least-once on
//! reconnect).
//!
//! High-level flow (one operation):
//! 1) A producer thread submits via [`Submitter`], which routes to a healthy
//!    node, pushes onto that node's MPSC input queue, and wakes the poller.
//! 2) The loop drains the handoff, moves the op input → write queue, and
//!    serializes it into the node's staging buffer.
//! 3) Socket writes drain the buffer; the op moves write → read queue.
//! 4) Socket reads feed the op until it reports complete, then it pops.
//!
//! The protocol layer stays outside: operations are opaque
//! ([`Operation`]), key→node routing is the caller's (a node index is passed
//! in), and wire formats never appear here.
//!
//! # Module map
//! - `buffer`: fixed-capacity write staging buffer and read-drain cursor.
//! - `config`: tunables and the production constants.
//! - `error`: stage-specific error enums.
//! - `mux`: the poller loop, connection lifecycle, and submission surface.
//! - `node`: per-server socket, buffers, and the three operation queues.
//! - `op`: the operation contract coupling core and protocol layer.
//! - `queue`: MPSC input queue, I/O-thread FIFOs, and their factory.
//! - `reconnect`: deadline-ordered reconnect schedule with backoff.
//! - `stats`: loop observability counters.

pub mod buffer;
pub mod config;
pub mod error;
mod mux;
mod node;
pub mod op;
pub mod queue;
mod reconnect;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_utils;

pub use buffer::{ReadCursor, WriteBuf};
pub use config::MuxConfig;
pub use error::{MuxError, ProtocolError, SubmitError};
pub use mux::{ClusterMux, Submitter};
pub use op::{BoxOp, GetCoalescer, OpState, Operation};
pub use queue::{DefaultQueueFactory, InputQueue, OpQueue, OpQueueFactory};
pub use stats::MuxStats;
