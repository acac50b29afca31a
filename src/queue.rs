//! Operation queues and the factory that supplies them.
//!
//! Each node carries three queues with different threading contracts:
//!
//! - **input** ([`InputQueue`]): lock-free MPSC. Any producer thread pushes;
//!   only the I/O thread pops. Backed by `crossbeam_queue::SegQueue`.
//! - **write** and **read** ([`OpQueue`]): plain FIFOs touched exclusively
//!   by the I/O thread.
//!
//! An operation lives in at most one queue at any instant; the transfers
//! input→write and write→read happen only on the I/O thread, so no external
//! synchronization is needed beyond the input queue's own.

use crossbeam_queue::SegQueue;
use std::collections::VecDeque;

use crate::op::BoxOp;

/// Lock-free MPSC submission queue.
///
/// Unbounded: the submission path never rejects work (an operation parks at
/// an unavailable node rather than failing), so the queue must not either.
pub struct InputQueue {
    inner: SegQueue<BoxOp>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Producer side. Safe from any thread.
    #[inline]
    pub fn push(&self, op: BoxOp) {
        self.inner.push(op);
    }

    /// Consumer side. Must only be called from the I/O thread.
    #[inline]
    pub fn pop(&self) -> Option<BoxOp> {
        self.inner.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// I/O-thread FIFO for operations mid-write or awaiting response bytes.
pub struct OpQueue {
    inner: VecDeque<BoxOp>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    #[inline]
    pub fn push_back(&mut self, op: BoxOp) {
        self.inner.push_back(op);
    }

    #[inline]
    pub fn push_front(&mut self, op: BoxOp) {
        self.inner.push_front(op);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<BoxOp> {
        self.inner.pop_front()
    }

    #[inline]
    pub fn front_mut(&mut self) -> Option<&mut BoxOp> {
        self.inner.front_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoxOp> {
        self.inner.iter()
    }

    /// Removes and returns the first `n` operations, preserving order.
    pub fn take_front(&mut self, n: usize) -> Vec<BoxOp> {
        debug_assert!(n <= self.inner.len());
        self.inner.drain(..n).collect()
    }

    /// Removes and returns everything, preserving order.
    pub fn drain_all(&mut self) -> Vec<BoxOp> {
        self.inner.drain(..).collect()
    }
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Supplies the three per-node queues at construction.
///
/// The default is unbounded on both sides; an alternative factory can swap
/// in pre-sized FIFOs without the core caring.
pub trait OpQueueFactory {
    fn create_input_queue(&self) -> InputQueue;
    fn create_op_queue(&self) -> OpQueue;
}

/// Unbounded queues all round.
pub struct DefaultQueueFactory;

impl OpQueueFactory for DefaultQueueFactory {
    fn create_input_queue(&self) -> InputQueue {
        InputQueue::new()
    }

    fn create_op_queue(&self) -> OpQueue {
        OpQueue::new()
    }
}
