//! Shared harness for the loopback integration tests: scripted operations,
//! a single-connection script server, and a bounded loop driver.
#![allow(dead_code)] // each test crate uses a subset of the harness

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cachemux::{
    BoxOp, ClusterMux, GetCoalescer, MuxConfig, OpState, Operation, ProtocolError, ReadCursor,
    WriteBuf,
};

/// Test-friendly tunables: short poll timeout, millisecond backoff.
pub fn test_config() -> MuxConfig {
    MuxConfig {
        idle_poll_timeout: Some(Duration::from_millis(10)),
        backoff_unit_ms: 1,
        ..MuxConfig::default()
    }
}

/// Drives `handle_io` until `done` holds, panicking past `deadline`.
pub fn run_until(mux: &mut ClusterMux, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "test deadline exceeded; stats: {:?}",
            mux.stats()
        );
        mux.handle_io().expect("handle_io failed");
    }
}

/// Outside view of one scripted operation.
#[derive(Default)]
pub struct OpProbe {
    completed: AtomicBool,
    initializations: AtomicU32,
}

impl OpProbe {
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn init_count(&self) -> u32 {
        self.initializations.load(Ordering::Acquire)
    }
}

/// Operation scripted with literal request/response bytes; decoding is a
/// byte-for-byte match, so any server-side deviation is a protocol error.
pub struct ScriptedOp {
    key: Option<Vec<u8>>,
    request: Vec<u8>,
    expect: Vec<u8>,
    wpos: usize,
    rpos: usize,
    state: OpState,
    probe: Arc<OpProbe>,
}

impl ScriptedOp {
    pub fn new(request: impl Into<Vec<u8>>, expect: impl Into<Vec<u8>>) -> (BoxOp, Arc<OpProbe>) {
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
        (Box::new(op), probe)
    }

    /// A coalescible single-key GET. `expect` is the op's own slice of the
    /// response stream (just its VALUE block when used under coalescing).
    pub fn get(key: &str, expect: impl Into<Vec<u8>>) -> (BoxOp, Arc<OpProbe>) {
        let probe = Arc::new(OpProbe::default());
        let op = Self {
            key: Some(key.as_bytes().to_vec()),
            request: format!("get {key}\r\n").into_bytes(),
            expect: expect.into(),
            wpos: 0,
            rpos: 0,
            state: OpState::Writing,
            probe: Arc::clone(&probe),
        };
        (Box::new(op), probe)
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
                String::from_utf8_lossy(&self.expect[self.rpos..self.rpos + n]),
                String::from_utf8_lossy(got)
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

/// Multi-key GET built by [`TestCoalescer`]: one merged request line, the
/// sub-operations decode their own response slices in order, then the
/// trailing `END\r\n` is checked.
struct MultiGetOp {
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
        if self.cur < self.subs.len() {
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
pub struct TestCoalescer;

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

/// One request/response exchange as the server sees it.
pub struct Exchange {
    pub expect: Vec<u8>,
    pub reply: Vec<u8>,
}

pub fn exchange(expect: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) -> Exchange {
    Exchange {
        expect: expect.into(),
        reply: reply.into(),
    }
}

/// Accepts one connection, plays the scripted exchanges byte-exactly, then
/// drains until the client hangs up. Any deviation panics the server thread
/// (surfaced by `join`).
pub fn serve_script(script: Vec<Exchange>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        play_script(&mut conn, &script);
        drain_to_eof(&mut conn);
    });
    (addr, handle)
}

pub fn play_script(conn: &mut TcpStream, script: &[Exchange]) {
    for ex in script {
        let mut got = vec![0u8; ex.expect.len()];
        conn.read_exact(&mut got).expect("read request");
        assert_eq!(
            got,
            ex.expect,
            "server saw {:?}",
            String::from_utf8_lossy(&got)
        );
        conn.write_all(&ex.reply).expect("write reply");
    }
}

pub fn drain_to_eof(conn: &mut TcpStream) {
    let mut sink = [0u8; 4096];
    while let Ok(n) = conn.read(&mut sink) {
        if n == 0 {
            break;
        }
    }
}

/// Reads one CRLF-terminated request line, however the bytes are chunked.
pub fn read_request_line(conn: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if memchr::memmem::find(&buf, b"\r\n").is_some() {
            return Ok(buf);
        }
        let n = conn.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client hung up mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
