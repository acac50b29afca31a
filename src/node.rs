//! Per-server connection state: socket, staging buffers, and the three
//! operation queues.
//!
//! A node is created once per configured server and lives for the pool's
//! lifetime; only its socket, registration interest, and buffer contents
//! cycle across reconnects. Operations flow input → write → read and leave
//! on completion.
//!
//! # Threading
//! Everything here belongs to the I/O thread except [`NodeShared`], the
//! producer-visible sliver: the MPSC input queue plus the reconnect-attempt
//! counter that submission reads to judge health. Producers tolerate a stale
//! counter; the circular search in submission converges regardless.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use mio::net::TcpStream;
use mio::Interest;
use tracing::trace;

use crate::buffer::{printable, ReadCursor, WriteBuf};
use crate::config::MuxConfig;
use crate::error::ProtocolError;
use crate::op::{GetCoalescer, OpState};
use crate::queue::{InputQueue, OpQueue, OpQueueFactory};

/// Producer-visible slice of a node.
pub(crate) struct NodeShared {
    /// MPSC submission queue; drained only by the I/O thread.
    pub(crate) input: InputQueue,
    /// 0 while the connection is believed healthy; producers read it to
    /// route around nodes that are reconnecting.
    pub(crate) reconnect_attempt: CachePadded<AtomicU32>,
}

impl NodeShared {
    pub(crate) fn new(input: InputQueue) -> Self {
        Self {
            input,
            reconnect_attempt: CachePadded::new(AtomicU32::new(0)),
        }
    }
}

/// One upstream server connection and its queued work.
pub(crate) struct Node {
    id: usize,
    addr: SocketAddr,
    /// `None` while the node awaits its reconnect deadline.
    stream: Option<TcpStream>,
    /// True once finish-connect has been observed on the current stream.
    connected: bool,
    /// Interest currently registered with the poller; `None` = deregistered.
    interest: Option<Interest>,
    read_buf: Box<[u8]>,
    write_buf: WriteBuf,
    write_q: OpQueue,
    read_q: OpQueue,
    protocol_errors: u32,
    shared: Arc<NodeShared>,
}

impl Node {
    pub(crate) fn new(
        id: usize,
        addr: SocketAddr,
        config: &MuxConfig,
        shared: Arc<NodeShared>,
        factory: &dyn OpQueueFactory,
    ) -> Self {
        assert!(config.read_buf_size > 0, "read buffer capacity must be > 0");
        Self {
            id,
            addr,
            stream: None,
            connected: false,
            interest: None,
            read_buf: vec![0u8; config.read_buf_size].into_boxed_slice(),
            write_buf: WriteBuf::new(config.write_buf_size),
            write_q: factory.create_op_queue(),
            read_q: factory.create_op_queue(),
            protocol_errors: 0,
            shared,
        }
    }

    #[inline]
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    #[inline]
    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Adopts a freshly initiated socket; finish-connect is still pending.
    /// The caller has already registered it with WRITABLE interest.
    pub(crate) fn install_stream(&mut self, stream: TcpStream) {
        debug_assert!(self.stream.is_none(), "installing over a live stream");
        self.stream = Some(stream);
        self.connected = false;
        self.interest = Some(Interest::WRITABLE);
    }

    /// Detaches the socket for close/deregistration. Clears connection and
    /// registration state so the node reads as "reconnecting".
    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        self.connected = false;
        self.interest = None;
        self.stream.take()
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self) {
        self.connected = true;
    }

    #[inline]
    pub(crate) fn current_interest(&self) -> Option<Interest> {
        self.interest
    }

    pub(crate) fn set_current_interest(&mut self, interest: Option<Interest>) {
        self.interest = interest;
    }

    #[inline]
    pub(crate) fn has_read_op(&self) -> bool {
        !self.read_q.is_empty()
    }

    #[inline]
    pub(crate) fn has_write_op(&self) -> bool {
        !self.write_q.is_empty()
    }

    /// Bytes staged but not yet accepted by the socket.
    #[inline]
    pub(crate) fn to_write(&self) -> usize {
        self.write_buf.pending_len()
    }

    /// Anything at all queued or staged on this connection.
    pub(crate) fn pending_io(&self) -> bool {
        self.has_read_op() || self.has_write_op() || self.to_write() > 0
    }

    #[inline]
    pub(crate) fn reconnect_attempt(&self) -> u32 {
        self.shared.reconnect_attempt.load(Ordering::Relaxed)
    }

    /// Increments the attempt counter, returning the new value.
    pub(crate) fn bump_reconnect_attempt(&self) -> u32 {
        self.shared.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_reconnect_attempt(&self) {
        self.shared.reconnect_attempt.store(0, Ordering::Relaxed);
    }

    /// Increments the consecutive-protocol-error count, returning it.
    pub(crate) fn bump_protocol_errors(&mut self) -> u32 {
        self.protocol_errors += 1;
        self.protocol_errors
    }

    pub(crate) fn clear_protocol_errors(&mut self) {
        self.protocol_errors = 0;
    }

    /// Drains the MPSC input queue into the write queue, preserving order.
    pub(crate) fn copy_input_queue(&mut self) {
        while let Some(op) = self.shared.input.pop() {
            self.write_q.push_back(op);
        }
    }

    /// The interest this node's state calls for. `None` means the socket
    /// should not be registered at all.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        self.stream.as_ref()?;
        if !self.connected {
            // Connect completion surfaces as writability.
            return Some(Interest::WRITABLE);
        }
        let read = self.has_read_op();
        let write = self.has_write_op() || self.to_write() > 0;
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Serializes queued operations into the write buffer until it fills or
    /// the write queue runs dry. Operations that finish serializing move to
    /// the read queue; operations that expect no response complete here and
    /// are dropped. Returns the number completed on write.
    ///
    /// When a coalescer is supplied, a run of two or more adjacent
    /// not-yet-started single-key GETs at the queue head is first collapsed
    /// into one combined operation.
    pub(crate) fn fill_write_buffer(&mut self, coalescer: Option<&dyn GetCoalescer>) -> usize {
        let mut completed = 0;
        loop {
            if self.write_buf.space_left() == 0 {
                break;
            }
            if let Some(c) = coalescer {
                self.coalesce_head(c);
            }
            let Some(op) = self.write_q.front_mut() else {
                break;
            };
            op.write_into(&mut self.write_buf);
            match op.state() {
                // Buffer filled mid-operation; resume on the next pass.
                OpState::Writing => break,
                OpState::Reading => {
                    if let Some(op) = self.write_q.pop_front() {
                        self.read_q.push_back(op);
                    }
                }
                OpState::Complete => {
                    self.write_q.pop_front();
                    completed += 1;
                }
            }
        }
        trace!(
            node = self.id,
            to_write = self.to_write(),
            buffered = %printable(self.write_buf.pending()),
            "filled write buffer"
        );
        completed
    }

    fn coalesce_head(&mut self, coalescer: &dyn GetCoalescer) {
        let run = self
            .write_q
            .iter()
            .take_while(|op| op.coalesce_key().is_some())
            .count();
        if run < 2 {
            return;
        }
        let subs = self.write_q.take_front(run);
        let mut combined = coalescer.combine(subs);
        combined.initialize();
        self.write_q.push_front(combined);
        trace!(node = self.id, run, "coalesced run of gets");
    }

    /// One non-blocking write of the staged bytes. Returns 0 when the socket
    /// is not writable (or nothing is staged); bytes accepted are consumed
    /// from the buffer.
    pub(crate) fn write_pending(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        if self.write_buf.is_empty() {
            return Ok(0);
        }
        loop {
            match stream.write(self.write_buf.pending()) {
                Ok(n) => {
                    self.write_buf.consume(n);
                    trace!(node = self.id, wrote = n, "wrote to socket");
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }

    /// One non-blocking read into the read buffer. Returns the byte count,
    /// 0 when the socket has nothing (or no stream), and an error on EOF:
    /// a peer hanging up mid-stream is connection-fatal.
    pub(crate) fn read_some(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        loop {
            match stream.read(&mut self.read_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ))
                }
                Ok(n) => {
                    trace!(node = self.id, read = n, "read from socket");
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }

    /// Feeds the first `n` bytes of the read buffer through the read queue.
    /// Completed operations pop off in order; returns how many completed.
    ///
    /// Bytes with no operation awaiting them, or an operation that makes no
    /// progress on a non-empty cursor, are protocol errors: the stream
    /// position can no longer be trusted.
    pub(crate) fn drain_read_buffer(&mut self, n: usize) -> Result<usize, ProtocolError> {
        let mut cursor = ReadCursor::new(&self.read_buf[..n]);
        let mut completed = 0;
        while !cursor.is_empty() {
            let Some(op) = self.read_q.front_mut() else {
                return Err(ProtocolError::UnexpectedBytes);
            };
            let before = cursor.remaining();
            op.read_from(&mut cursor)?;
            if op.state() == OpState::Complete {
                self.read_q.pop_front();
                completed += 1;
            } else if cursor.remaining() == before {
                return Err(ProtocolError::desync("read operation made no progress"));
            }
        }
        Ok(completed)
    }

    /// Rebuilds the input queue for resend after a disconnect: operations
    /// awaiting responses first, then operations still being written, then
    /// whatever producers queued meanwhile, all rewound to their pristine
    /// state. Staged bytes are discarded; they will be re-serialized.
    ///
    /// Delivery on the new connection is at-least-once: an operation whose
    /// response was lost with the old socket runs again.
    pub(crate) fn setup_resend(&mut self) {
        let mut deferred = Vec::new();
        while let Some(op) = self.shared.input.pop() {
            deferred.push(op);
        }
        let read_ops = self.read_q.drain_all();
        let write_ops = self.write_q.drain_all();
        for mut op in read_ops.into_iter().chain(write_ops) {
            op.initialize();
            self.shared.input.push(op);
        }
        for op in deferred {
            self.shared.input.push(op);
        }
        self.write_buf.clear();
        self.protocol_errors = 0;
    }
}
