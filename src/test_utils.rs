//! Scripted operations for unit tests.
//!
//! A [`ScriptedOp`] carries its literal request bytes and the exact response
//! bytes it expects; decoding is a byte-for-byte match, so any server-side
//! deviation surfaces as a protocol error. An [`OpProbe`] gives tests an
//! outside view of completion and rewind counts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::{ReadCursor, WriteBuf};
use crate::error::ProtocolError;
use crate::op::{BoxOp, GetCoalescer, OpState, Operation};

/// Shared observation point for one scripted operation.
#[derive(Default)]
pub(crate) struct OpProbe {
    completed: AtomicBool,
    initializations: AtomicU32,
}

impl OpProbe {
    pub(crate) fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn init_count(&self) -> u32 {
        self.initializations.load(Ordering::Acquire)
    }
}

/// Operation scripted with literal request/response bytes.
pub(crate) struct ScriptedOp {
    key: Option<Vec<u8>>,
    request: Vec<u8>,
    expect: Vec<u8>,
    wpos: usize,
    rpos: usize,
    state: OpState,
    probe: Arc<OpProbe>,
}

impl ScriptedOp {
    pub(crate) fn new(
        request: impl Into<Vec<u8>>,
        expect: impl Into<Vec<u8>>,
    ) -> (Self, Arc<OpProbe>) {
        let probe = Arc::new(OpProbe::default());
        let op = Self {
            key: None,
            request: request.into(),
            expect: expect.into(),
            wpos: 0,
            rpos: 0,
            state: OpState::Writing,
            probe: Arc::clone(&probe),
        };
        (op, probe)
    }

    /// A coalescible single-key GET. `expect` is the op's own slice of the
    /// response stream (just its VALUE block when used under coalescing).
    pub(crate) fn get(key: &str, expect: impl Into<Vec<u8>>) -> (Self, Arc<OpProbe>) {
        let (mut op, probe) = Self::new(format!("get {key}\r\n"), expect);
        op.key = Some(key.as_bytes().to_vec());
        (op, probe)
    }

    pub(crate) fn boxed(self) -> BoxOp {
        Box::new(self)
    }
}

impl Operation for ScriptedOp {
    fn initialize(&mut self) {
        self.wpos = 0;
        self.rpos = 0;
        self.state = OpState::Writing;
        self.probe.initializations.fetch_add(1, Ordering::AcqRel);
    }

    fn write_into(&mut self, dst: &mut WriteBuf) -> usize {
        let n = dst.push_slice(&self.request[self.wpos..]);
        self.wpos += n;
        if self.wpos == self.request.len() {
            if self.expect.is_empty() {
                self.state = OpState::Complete;
                self.probe.completed.store(true, Ordering::Release);
            } else {
                self.state = OpState::Reading;
            }
        }
        n
    }

    fn read_from(&mut self, src: &mut ReadCursor<'_>) -> Result<(), ProtocolError> {
        let want = self.expect.len() - self.rpos;
        let n = want.min(src.remaining());
        let got = src.take(n);
        if got != &self.expect[self.rpos..self.rpos + n] {
            return Err(ProtocolError::desync(format!(
                "expected {:?}, got {:?}",
                &self.expect[self.rpos..self.rpos + n],
                got
            )));
        }
        self.rpos += n;
        if self.rpos == self.expect.len() {
            self.state = OpState::Complete;
            self.probe.completed.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn state(&self) -> OpState {
        self.state
    }

    fn coalesce_key(&self) -> Option<&[u8]> {
        if self.wpos == 0 {
            self.key.as_deref()
        } else {
            None
        }
    }
}

/// Multi-key GET produced by [`TestCoalescer`]: one merged request line, the
/// sub-operations decode their own response slices in order, then the
/// trailing terminator is checked.
pub(crate) struct MultiGetOp {
    request: Vec<u8>,
    terminator: Vec<u8>,
    subs: Vec<BoxOp>,
    cur: usize,
    wpos: usize,
    tpos: usize,
    state: OpState,
}

impl Operation for MultiGetOp {
    fn initialize(&mut self) {
        self.wpos = 0;
        self.tpos = 0;
        self.cur = 0;
        self.state = OpState::Writing;
        for sub in &mut self.subs {
            sub.initialize();
        }
    }

    fn write_into(&mut self, dst: &mut WriteBuf) -> usize {
        let n = dst.push_slice(&self.request[self.wpos..]);
        self.wpos += n;
        if self.wpos == self.request.len() {
            self.state = OpState::Reading;
        }
        n
    }

    fn read_from(&mut self, src: &mut ReadCursor<'_>) -> Result<(), ProtocolError> {
        while !src.is_empty() && self.cur < self.subs.len() {
            let sub = &mut self.subs[self.cur];
            sub.read_from(src)?;
            if sub.state() == OpState::Complete {
                self.cur += 1;
            } else {
                return Ok(());
            }
        }
        if src.is_empty() && self.cur < self.subs.len() {
            return Ok(());
        }
        let want = self.terminator.len() - self.tpos;
        let n = want.min(src.remaining());
        let got = src.take(n);
        if got != &self.terminator[self.tpos..self.tpos + n] {
            return Err(ProtocolError::desync("bad multi-get terminator"));
        }
        self.tpos += n;
        if self.tpos == self.terminator.len() {
            self.state = OpState::Complete;
        }
        Ok(())
    }

    fn state(&self) -> OpState {
        self.state
    }
}

/// Builds `get k1 k2 .. kn\r\n` from a run of coalescible ops.
pub(crate) struct TestCoalescer;

impl GetCoalescer for TestCoalescer {
    fn combine(&self, ops: Vec<BoxOp>) -> BoxOp {
        let mut request = b"get".to_vec();
        for op in &ops {
            request.push(b' ');
            request.extend_from_slice(op.coalesce_key().expect("run member lost its key"));
        }
        request.extend_from_slice(b"\r\n");
        Box::new(MultiGetOp {
            request,
            terminator: b"END\r\n".to_vec(),
            subs: ops,
            cur: 0,
            wpos: 0,
            tpos: 0,
            state: OpState::Writing,
        })
    }
}
