//! The multiplexer: one readiness loop driving every server connection.
//!
//! # Threading
//! [`ClusterMux`] is owned by a single I/O thread that calls
//! [`handle_io`](ClusterMux::handle_io) in a loop. Producers hold a
//! [`Submitter`], a cheap clone over the shared state, and never touch the
//! poller, the sockets, or the buffers. The waker is the only cross-thread
//! signal: every submission (and shutdown) wakes the poller.
//!
//! # Loop shape
//! One iteration: drain the handoff queue of nodes with newly submitted
//! work, select with a timeout derived from the earliest reconnect deadline,
//! service ready sockets, then attempt any due reconnects. Connection-level
//! failures never escape the iteration; they recycle the one connection and
//! the loop moves on.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::config::MuxConfig;
use crate::error::{MuxError, ReadError, SubmitError};
use crate::node::{Node, NodeShared};
use crate::op::{BoxOp, GetCoalescer};
use crate::queue::{DefaultQueueFactory, OpQueueFactory};
use crate::reconnect::{backoff_delay, ReconnectSchedule};
use crate::stats::MuxStats;

/// Token reserved for the waker; node tokens are their arena indices.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// State reachable from producer threads.
struct MuxShared {
    nodes: Box<[Arc<NodeShared>]>,
    /// Nodes with newly queued work awaiting I/O-thread attention.
    /// Duplicates are harmless; the drain is idempotent per node.
    handoff: SegQueue<usize>,
    waker: Waker,
    shut_down: CachePadded<AtomicBool>,
}

/// Producer-side handle for submitting operations and requesting shutdown.
///
/// Cloneable and `Send`; any number of threads may submit concurrently with
/// the I/O thread.
#[derive(Clone)]
pub struct Submitter {
    shared: Arc<MuxShared>,
}

impl Submitter {
    /// Enqueues `op`, preferring the node at `which`.
    ///
    /// If the preferred node is reconnecting, the search advances circularly
    /// to the next healthy node. When every node is down the operation parks
    /// at the originally requested node and waits for it to recover:
    /// key affinity is preserved over availability.
    ///
    /// # Panics
    /// If `which` is out of range.
    pub fn submit(&self, which: usize, mut op: BoxOp) -> Result<(), SubmitError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown);
        }
        let n = self.shared.nodes.len();
        assert!(which < n, "node index {which} out of range ({n} nodes)");
        let mut pos = which;
        let mut loops = 0u32;
        loop {
            debug_assert!(loops < 3, "circular node search failed to terminate");
            if pos == which {
                loops += 1;
            }
            let node = &self.shared.nodes[pos];
            // A zero attempt counter means the node is not mid-reconnect.
            // After a full wrap (loops > 1) the operation goes back to the
            // preferred node regardless.
            if node.reconnect_attempt.load(Ordering::Relaxed) == 0 || loops > 1 {
                op.initialize();
                node.input.push(op);
                self.shared.handoff.push(pos);
                if let Err(err) = self.shared.waker.wake() {
                    warn!(error = %err, "failed to wake poller after submit");
                }
                debug!(node = pos, preferred = which, "queued operation");
                return Ok(());
            }
            pos = (pos + 1) % n;
        }
    }

    /// Flags the mux for shutdown and wakes the poller. The I/O thread
    /// observes the flag on its next iteration, closes every channel, and
    /// fails out of `handle_io`.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            warn!(error = %err, "failed to wake poller for shutdown");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

/// Connection pool to a fleet of cache servers, multiplexed over one
/// readiness poller.
pub struct ClusterMux {
    poll: Poll,
    nodes: Vec<Node>,
    shared: Arc<MuxShared>,
    reconnect: ReconnectSchedule,
    config: MuxConfig,
    optimize_gets: bool,
    coalescer: Option<Box<dyn GetCoalescer>>,
    empty_selects: u32,
    stats: MuxStats,
}

impl ClusterMux {
    /// Opens a non-blocking socket per address and registers it. Connects
    /// complete asynchronously; only early initiation failures error here.
    pub fn new(config: MuxConfig, addrs: &[SocketAddr]) -> io::Result<Self> {
        Self::with_queue_factory(config, &DefaultQueueFactory, addrs)
    }

    /// As [`new`](Self::new), with caller-supplied operation queues.
    pub fn with_queue_factory(
        config: MuxConfig,
        factory: &dyn OpQueueFactory,
        addrs: &[SocketAddr],
    ) -> io::Result<Self> {
        assert!(!addrs.is_empty(), "at least one server address is required");
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let mut node_shared = Vec::with_capacity(addrs.len());
        let mut nodes = Vec::with_capacity(addrs.len());
        for (idx, &addr) in addrs.iter().enumerate() {
            let shared = Arc::new(NodeShared::new(factory.create_input_queue()));
            let mut node = Node::new(idx, addr, &config, Arc::clone(&shared), factory);
            let stream = initiate_connect(poll.registry(), idx, addr)?;
            node.install_stream(stream);
            info!(node = idx, %addr, "initiating connection");
            node_shared.push(shared);
            nodes.push(node);
        }
        Ok(Self {
            poll,
            nodes,
            shared: Arc::new(MuxShared {
                nodes: node_shared.into_boxed_slice(),
                handoff: SegQueue::new(),
                waker,
                shut_down: CachePadded::new(AtomicBool::new(false)),
            }),
            reconnect: ReconnectSchedule::new(),
            config,
            optimize_gets: true,
            coalescer: None,
            empty_selects: 0,
            stats: MuxStats::default(),
        })
    }

    /// Producer-side handle. Cheap to clone, safe to share across threads.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enables or disables collapsing runs of single-key GETs into one
    /// multi-key GET. On by default; a coalescer must also be installed.
    pub fn set_get_optimization(&mut self, enabled: bool) {
        self.optimize_gets = enabled;
    }

    /// Installs (or removes) the protocol layer's GET coalescer.
    pub fn set_coalescer(&mut self, coalescer: Option<Box<dyn GetCoalescer>>) {
        self.coalescer = coalescer;
    }

    /// Number of configured server connections.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Remote address of the node at `idx`.
    ///
    /// # Panics
    /// If `idx` is out of range.
    pub fn address_of(&self, idx: usize) -> SocketAddr {
        self.nodes[idx].addr()
    }

    /// Current reconnect-attempt count for the node at `idx`; 0 means the
    /// connection is believed healthy.
    pub fn reconnect_attempt(&self, idx: usize) -> u32 {
        self.nodes[idx].reconnect_attempt()
    }

    /// Snapshot of the loop counters.
    pub fn stats(&self) -> MuxStats {
        self.stats
    }

    /// One iteration of the I/O loop.
    ///
    /// Fails only on shutdown or a poller-level error; per-connection I/O
    /// and protocol failures are absorbed into reconnects.
    pub fn handle_io(&mut self) -> Result<(), MuxError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            self.close_all();
            return Err(MuxError::ShutDown);
        }

        self.drain_handoff();
        debug_assert!(
            self.interest_sets_consistent(),
            "interest sets inconsistent before select"
        );

        let timeout = self
            .reconnect
            .select_timeout(Instant::now())
            .or(self.config.idle_poll_timeout);
        trace!(?timeout, "selecting");
        let mut events = Events::with_capacity(self.config.poll_capacity);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(MuxError::Poll(err)),
        }
        self.stats.selects += 1;

        let now = Instant::now();
        let mut ready_nodes = 0usize;
        for event in events.iter() {
            let Token(idx) = event.token();
            if event.token() == WAKE_TOKEN || idx >= self.nodes.len() {
                continue;
            }
            ready_nodes += 1;
            trace!(
                node = idx,
                readable = event.is_readable(),
                writable = event.is_writable(),
                "ready"
            );
            self.handle_ready(idx, event.is_readable(), event.is_writable(), now);
        }

        if ready_nodes == 0 {
            self.stats.empty_selects += 1;
            self.empty_selects += 1;
            if self.empty_selects > self.config.excessive_empty {
                self.sweep_registrations(now);
                self.empty_selects = 0;
            }
        } else {
            self.empty_selects = 0;
        }

        if !self.reconnect.is_empty() {
            self.attempt_reconnects(Instant::now());
        }
        Ok(())
    }

    /// Closes every channel and flags the mux; subsequent `handle_io` calls
    /// fail with [`MuxError::ShutDown`].
    pub fn shutdown(&mut self) {
        self.shared.shut_down.store(true, Ordering::Release);
        self.close_all();
    }

    // Deal with everything that has been submitted but may not yet be
    // reflected in any interest set.
    fn drain_handoff(&mut self) {
        let mut deferred: Vec<usize> = Vec::new();
        while let Some(idx) = self.shared.handoff.pop() {
            let node = &mut self.nodes[idx];
            let ready_for_io = node.is_connected() && node.has_write_op();
            if !node.is_connected() {
                // Revisit once the connect completes.
                if !deferred.contains(&idx) {
                    deferred.push(idx);
                }
            }
            node.copy_input_queue();
            if ready_for_io {
                trace!(node = idx, "handling queued write");
                if let Err(err) = self.handle_writes(idx) {
                    warn!(node = idx, error = %err, "write failed while draining handoff");
                    self.queue_reconnect(idx, Instant::now());
                }
            }
            self.fixup_interest(idx);
        }
        for idx in deferred {
            self.shared.handoff.push(idx);
        }
    }

    fn handle_ready(&mut self, idx: usize, readable: bool, writable: bool, now: Instant) {
        if self.nodes[idx].stream().is_none() {
            // Stale event for a socket already torn down this iteration.
            return;
        }
        if !self.nodes[idx].is_connected() {
            match self.finish_connect(idx) {
                Ok(true) => {
                    info!(node = idx, addr = %self.nodes[idx].addr(), "connection established");
                    self.nodes[idx].reset_reconnect_attempt();
                    self.shared.handoff.push(idx);
                    if self.nodes[idx].to_write() > 0 {
                        if let Err(err) = self.handle_writes(idx) {
                            warn!(node = idx, error = %err, "write failed after connect");
                            self.queue_reconnect(idx, now);
                        }
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(node = idx, addr = %self.nodes[idx].addr(), error = %err, "connect failed");
                    self.queue_reconnect(idx, now);
                }
            }
        } else {
            if writable {
                if let Err(err) = self.handle_writes(idx) {
                    info!(node = idx, error = %err, "write failed, reconnecting");
                    self.queue_reconnect(idx, now);
                }
            }
            if readable && self.nodes[idx].stream().is_some() {
                match self.handle_reads(idx) {
                    Ok(()) => self.nodes[idx].clear_protocol_errors(),
                    Err(ReadError::Protocol(err)) => {
                        self.stats.protocol_errors += 1;
                        let count = self.nodes[idx].bump_protocol_errors();
                        warn!(node = idx, error = %err, count, "protocol error on read");
                        if count >= self.config.excessive_errors {
                            self.queue_reconnect(idx, now);
                        }
                    }
                    Err(ReadError::Io(err)) => {
                        info!(node = idx, error = %err, "read failed, reconnecting");
                        self.queue_reconnect(idx, now);
                    }
                }
            }
        }
        self.fixup_interest(idx);
    }

    fn finish_connect(&mut self, idx: usize) -> io::Result<bool> {
        let node = &mut self.nodes[idx];
        let Some(stream) = node.stream_mut() else {
            return Ok(false);
        };
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => {
                node.set_connected();
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    // Fill-then-write until no progress: each pass serializes queued ops
    // into the staging buffer, then pushes the buffer at the socket.
    fn handle_writes(&mut self, idx: usize) -> io::Result<()> {
        let coalescer: Option<&dyn GetCoalescer> = if self.optimize_gets {
            self.coalescer.as_deref()
        } else {
            None
        };
        let node = &mut self.nodes[idx];
        self.stats.ops_completed += node.fill_write_buffer(coalescer) as u64;
        let mut can_write_more = node.to_write() > 0;
        while can_write_more {
            let wrote = node.write_pending()?;
            self.stats.bytes_written += wrote as u64;
            self.stats.ops_completed += node.fill_write_buffer(coalescer) as u64;
            can_write_more = wrote > 0 && node.to_write() > 0;
        }
        Ok(())
    }

    // Read until the socket runs dry, feeding each fill through the read
    // queue. EOF and I/O errors poison the connection; decode errors poison
    // the current operation's connection via the protocol-error counter.
    fn handle_reads(&mut self, idx: usize) -> Result<(), ReadError> {
        let node = &mut self.nodes[idx];
        loop {
            let n = node.read_some()?;
            if n == 0 {
                return Ok(());
            }
            self.stats.bytes_read += n as u64;
            let completed = node.drain_read_buffer(n)?;
            self.stats.ops_completed += completed as u64;
        }
    }

    /// Tears the connection down and schedules it for a backed-off retry,
    /// re-queueing all in-flight operations for resend. No-op when the
    /// channel is already gone or the mux is shutting down.
    fn queue_reconnect(&mut self, idx: usize, now: Instant) {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return;
        }
        if self.nodes[idx].stream().is_none() {
            return;
        }
        let attempt = self.nodes[idx].bump_reconnect_attempt();
        warn!(
            node = idx,
            addr = %self.nodes[idx].addr(),
            attempt,
            "closing connection, scheduling reconnect"
        );
        if let Some(mut stream) = self.nodes[idx].take_stream() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        let delay = backoff_delay(
            attempt,
            self.config.backoff_unit_ms,
            self.config.max_reconnect_delay,
        );
        self.reconnect.schedule(now + delay, idx);
        self.nodes[idx].setup_resend();
        self.stats.reconnects += 1;
    }

    fn attempt_reconnects(&mut self, now: Instant) {
        for idx in self.reconnect.drain_due(now) {
            let addr = self.nodes[idx].addr();
            info!(node = idx, %addr, "reconnecting");
            match initiate_connect(self.poll.registry(), idx, addr) {
                Ok(stream) => self.nodes[idx].install_stream(stream),
                Err(err) => {
                    warn!(node = idx, %addr, error = %err, "reconnect attempt failed");
                    let attempt = self.nodes[idx].bump_reconnect_attempt();
                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_unit_ms,
                        self.config.max_reconnect_delay,
                    );
                    self.reconnect.schedule(now + delay, idx);
                }
            }
        }
    }

    // Excessive empty selects usually mean a dead peer left a registration
    // permanently signalled or permanently silent. Drive every connection
    // with observable work directly; recycle the rest.
    fn sweep_registrations(&mut self, now: Instant) {
        warn!(
            empty_selects = self.empty_selects,
            "excessive empty selects, sweeping registrations"
        );
        self.stats.defensive_sweeps += 1;
        for idx in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if node.stream().is_none() {
                continue;
            }
            if node.is_connected() && node.pending_io() {
                debug!(node = idx, "sweep: driving pending work");
                self.handle_ready(idx, true, true, now);
            } else {
                debug!(node = idx, "sweep: no observable activity, recycling");
                self.queue_reconnect(idx, now);
            }
        }
    }

    // The interest set is a pure function of node state; reconcile the
    // registration whenever they diverge.
    fn fixup_interest(&mut self, idx: usize) {
        let desired = self.nodes[idx].desired_interest();
        let current = self.nodes[idx].current_interest();
        if desired == current {
            return;
        }
        let registry = self.poll.registry();
        let node = &mut self.nodes[idx];
        let result = match (current, desired) {
            (None, Some(interest)) => match node.stream_mut() {
                Some(stream) => registry.register(stream, Token(idx), interest),
                None => return,
            },
            (Some(_), Some(interest)) => match node.stream_mut() {
                Some(stream) => registry.reregister(stream, Token(idx), interest),
                None => return,
            },
            (Some(_), None) => match node.stream_mut() {
                Some(stream) => registry.deregister(stream),
                None => return,
            },
            (None, None) => return,
        };
        match result {
            Ok(()) => {
                self.nodes[idx].set_current_interest(desired);
                trace!(node = idx, ?desired, "interest updated");
            }
            Err(err) => {
                warn!(node = idx, error = %err, "failed to update registration");
                self.queue_reconnect(idx, Instant::now());
            }
        }
    }

    fn interest_sets_consistent(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.current_interest() == node.desired_interest())
    }

    fn close_all(&mut self) {
        for idx in 0..self.nodes.len() {
            let to_write = self.nodes[idx].to_write();
            if let Some(mut stream) = self.nodes[idx].take_stream() {
                if to_write > 0 {
                    warn!(node = idx, to_write, "shutting down with unwritten bytes");
                }
                let _ = self.poll.registry().deregister(&mut stream);
                debug!(node = idx, "closed channel");
            }
        }
    }
}

impl fmt::Display for ClusterMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster mux to")?;
        for node in &self.nodes {
            write!(f, " {}", node.addr())?;
        }
        Ok(())
    }
}

fn initiate_connect(registry: &Registry, idx: usize, addr: SocketAddr) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    registry.register(&mut stream, Token(idx), Interest::WRITABLE)?;
    Ok(stream)
}
