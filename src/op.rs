//! The operation contract: the entire coupling between the multiplexer core
//! and the protocol layer above it.
//!
//! An operation is an opaque unit of work that serializes its request bytes
//! into a node's write buffer, consumes response bytes from the read buffer,
//! and reports its lifecycle through [`OpState`]. The core reacts only to
//! state transitions; it never inspects concrete operation types.
//!
//! # Ownership
//!
//! Operations are created by the caller, boxed, and handed to the core via
//! submission. The core owns the box while the operation sits in a queue and
//! drops it once `Complete` is observed. Completion *notification* is the
//! operation's own concern (a callback or flag inside the implementation);
//! nothing flows back through the core.

use crate::buffer::{ReadCursor, WriteBuf};
use crate::error::ProtocolError;

/// Lifecycle of an operation as seen by the I/O loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    /// Request bytes still need to be serialized onto the wire.
    Writing,
    /// Request fully written; awaiting response bytes.
    Reading,
    /// Response fully decoded (or no response expected). The core drops the
    /// operation at the next queue transfer.
    Complete,
}

/// An opaque protocol operation.
///
/// Implementations must be `Send`: operations are constructed on producer
/// threads and cross to the I/O thread at submission. After enqueue they are
/// touched only by the I/O thread until completion.
pub trait Operation: Send {
    /// Rewinds the operation to its pristine pre-wire state.
    ///
    /// Called once just before enqueue, and again whenever the operation is
    /// re-injected for resend after a reconnect; a partially written or
    /// partially decoded operation must restart from byte zero.
    fn initialize(&mut self);

    /// Appends as many request bytes as fit into `dst`, returning the count.
    ///
    /// May span multiple calls; the operation keeps its own write cursor.
    /// When the last byte has been handed over the state must leave
    /// `Writing` (to `Reading`, or straight to `Complete` for operations
    /// that expect no response).
    fn write_into(&mut self, dst: &mut WriteBuf) -> usize;

    /// Consumes zero or more response bytes from `src`, advancing internal
    /// parse state.
    ///
    /// Returning a [`ProtocolError`] signals that the stream can no longer
    /// be trusted; the core recycles the connection. Leaving bytes in `src`
    /// without consuming any while still `Reading` is treated as a desync.
    fn read_from(&mut self, src: &mut ReadCursor<'_>) -> Result<(), ProtocolError>;

    /// Current lifecycle state.
    fn state(&self) -> OpState;

    /// The key of a not-yet-started single-key GET, if this operation is one.
    ///
    /// The core uses this to find runs of adjacent operations that can be
    /// collapsed into a single multi-key GET. Implementations must return
    /// `None` once serialization has begun; a partially written operation
    /// can no longer join a batch.
    fn coalesce_key(&self) -> Option<&[u8]> {
        None
    }
}

/// Boxed operation as it travels through the queues.
pub type BoxOp = Box<dyn Operation>;

/// Merges runs of adjacent single-key GETs into one multi-key GET.
///
/// Supplied by the protocol layer via
/// [`ClusterMux::set_coalescer`](crate::ClusterMux::set_coalescer); the core
/// invokes it only on runs of two or more operations whose
/// [`Operation::coalesce_key`] is `Some`. The combined operation must
/// demultiplex the response so each sub-operation still observes its own
/// completion, in submission order. The core calls `initialize()` on the
/// returned operation before serializing it.
pub trait GetCoalescer: Send {
    fn combine(&self, ops: Vec<BoxOp>) -> BoxOp;
}
