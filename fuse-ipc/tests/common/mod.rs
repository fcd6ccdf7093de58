//! Shared fixture: a session plus a hand-driven daemon end.
//!
//! Tests play the daemon themselves by reading requests from the device and
//! writing answers back, so every interleaving is explicit.

// Each test binary uses a different subset.
#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use fuse_ipc::protocol::abi::InitOut;
use fuse_ipc::protocol::{IN_HEADER_SIZE, OUT_HEADER_SIZE};
use fuse_ipc::{
    CancelToken, Credentials, Device, Dispatch, InHeader, IpcError, Opcode, OutHeader, Session,
    SessionConfig,
};
use tracing_subscriber::EnvFilter;
use zerocopy::{FromBytes, IntoBytes};

/// Target name for fixture logs.
const TARGET: &str = "fuse_ipc::fixture";

/// How long a test waits for a caller thread before failing.
pub const CALLER_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

/// A request as the daemon sees it.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: InHeader,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        Opcode::try_from(self.header.opcode).expect("unknown opcode on the wire")
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }
}

/// Outcome of a caller thread: the answer body or the error.
pub type CallResult = Result<Vec<u8>, IpcError>;

pub struct Fixture {
    pub session: Arc<Session>,
    pub device: Arc<Device>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::new())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_tracing();
        let session = Session::new(config);
        let device = Arc::new(Device::new(Arc::clone(&session)));
        Self { session, device }
    }

    /// Block until the next request is available and read it.
    pub fn read_request(&self) -> Request {
        let mut buf = vec![0u8; 1 << 20];
        let len = self.device.read(&mut buf).expect("device read failed");
        let (header, rest) = InHeader::read_from_prefix(&buf[..len]).unwrap();
        assert_eq!(header.len as usize, len, "request header length");
        tracing::debug!(target: TARGET, unique = header.unique, opcode = header.opcode, "daemon read");
        Request {
            header,
            payload: rest.to_vec(),
        }
    }

    /// Read a request if one is queued, without blocking.
    pub fn try_read_request(&self) -> Option<Request> {
        self.device.set_nonblocking(true);
        let mut buf = vec![0u8; 1 << 20];
        let result = self.device.read(&mut buf);
        self.device.set_nonblocking(false);
        match result {
            Ok(len) => {
                let (header, rest) = InHeader::read_from_prefix(&buf[..len]).unwrap();
                Some(Request {
                    header,
                    payload: rest.to_vec(),
                })
            }
            Err(IpcError::WouldBlock) => None,
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }

    /// Write one answer frame.
    pub fn reply(&self, unique: u64, error: i32, body: &[u8]) -> Result<usize, IpcError> {
        self.device.write(&frame(unique, error, body))
    }

    /// Run the handshake against a 7.28 daemon granting `flags`.
    pub fn complete_init(&self, flags: u32) {
        self.session.send_init().unwrap();
        let req = self.read_request();
        assert_eq!(req.opcode(), Opcode::Init);
        let out = init_out(28, flags);
        self.reply(req.unique(), 0, out.as_bytes()).unwrap();
        self.session.wait_init(CALLER_TIMEOUT).unwrap();
    }

    /// Issue a request from another thread.
    pub fn spawn_call(
        &self,
        opcode: Opcode,
        nodeid: u64,
        payload: Vec<u8>,
        cancel: Option<Arc<CancelToken>>,
    ) -> mpsc::Receiver<CallResult> {
        let session = Arc::clone(&self.session);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = Dispatch::with_payload(
                &session,
                opcode,
                nodeid,
                Credentials::current(),
                &payload,
            )
            .wait_answer(cancel.as_deref())
            .map(|answer| answer.bytes());
            let _ = tx.send(result);
        });
        rx
    }

    /// Wait until `n` requests sit in the outbound queue.
    pub fn wait_queued(&self, n: usize) {
        wait_for(|| self.session.queue().len() == n);
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an answer frame.
pub fn frame(unique: u64, error: i32, body: &[u8]) -> Vec<u8> {
    let hdr = OutHeader {
        len: (OUT_HEADER_SIZE + body.len()) as u32,
        error,
        unique,
    };
    let mut buf = hdr.as_bytes().to_vec();
    buf.extend_from_slice(body);
    buf
}

/// A full-size `FUSE_INIT` answer for minor version `minor`.
pub fn init_out(minor: u32, flags: u32) -> InitOut {
    InitOut {
        major: 7,
        minor,
        max_readahead: 32 * 1024,
        flags,
        max_write: 128 * 1024,
        time_gran: 1,
        ..Default::default()
    }
}

/// Poll `cond` until it holds.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + CALLER_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Receive a caller's result, failing the test if it never arrives.
pub fn recv(rx: &mpsc::Receiver<CallResult>) -> CallResult {
    rx.recv_timeout(CALLER_TIMEOUT)
        .expect("caller did not finish in time")
}

/// Size of a request carrying `payload_len` payload bytes.
pub fn request_len(payload_len: usize) -> usize {
    IN_HEADER_SIZE + payload_len
}
