//! Simulated filesystem daemon.
//!
//! One reader thread pulls requests off the wire and fans them out to a
//! worker pool over a crossbeam channel. Workers sleep for the configured
//! latency and answer, so answers routinely arrive out of order.
//! Interrupted requests are answered with `EINTR`; interrupts themselves are
//! never answered.

use crossbeam_channel::{bounded, Receiver};
use fuse_ipc::protocol::abi::{
    AttrOut, EntryOut, InitIn, InitOut, InterruptIn, OpenOut, ReadIn, WriteOut,
};
use fuse_ipc::protocol::{InHeader, OUT_HEADER_SIZE};
use fuse_ipc::transport::read_frame;
use fuse_ipc::{Device, IpcError, Opcode, OutHeader};
use std::collections::HashSet;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use zerocopy::{FromBytes, IntoBytes};

const TARGET: &str = "fuse-ipc-stress::daemon";

/// Size of `fuse_write_in`, which precedes the data of a write request.
const WRITE_IN_SIZE: usize = 40;

/// Largest read answered, regardless of the requested size.
const MAX_READ_ANSWER: usize = 64 * 1024;

/// Where the daemon reads requests and writes answers.
pub trait Wire: Send + Sync {
    /// Next request frame, or `None` once the connection is gone.
    fn recv(&self) -> io::Result<Option<Vec<u8>>>;

    fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Drives the engine's device directly.
pub struct DeviceWire(pub Arc<Device>);

impl Wire for DeviceWire {
    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 1 << 20];
        match self.0.read(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(IpcError::ConnectionClosed) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        match self.0.write(frame) {
            Ok(_) => Ok(()),
            // The caller gave up; the engine logs it.
            Err(IpcError::Protocol(err)) if !err.is_fatal() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Talks to the engine over the daemon end of a socket pair.
pub struct StreamWire {
    reader: Mutex<UnixStream>,
    writer: Mutex<UnixStream>,
}

impl StreamWire {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        Ok(Self {
            reader: Mutex::new(stream.try_clone()?),
            writer: Mutex::new(stream),
        })
    }
}

impl Wire for StreamWire {
    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| io::Error::other("reader lock poisoned"))?;
        match read_frame(&mut *reader) {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("writer lock poisoned"))?;
        writer.write_all(frame)
    }
}

/// Running daemon threads.
pub struct Daemon {
    threads: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn spawn(wire: Arc<dyn Wire>, workers: usize, latency: Duration) -> io::Result<Self> {
        let (tx, rx) = bounded::<Vec<u8>>(workers * 4);
        let interrupted = Arc::new(Mutex::new(HashSet::new()));
        let mut threads = Vec::with_capacity(workers + 1);

        let reader_wire = Arc::clone(&wire);
        let reader_interrupted = Arc::clone(&interrupted);
        threads.push(
            thread::Builder::new()
                .name("daemon-reader".to_string())
                .spawn(move || {
                    let mut count = 0u64;
                    loop {
                        let frame = match reader_wire.recv() {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(target: TARGET, error = %err, "read failed");
                                break;
                            }
                        };
                        count += 1;
                        if let Some(target) = interrupt_target(&frame) {
                            note_interrupt(&reader_interrupted, target);
                            continue;
                        }
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    tracing::info!(target: TARGET, count, "reader exiting");
                })?,
        );

        for id in 0..workers {
            let rx = rx.clone();
            let wire = Arc::clone(&wire);
            let interrupted = Arc::clone(&interrupted);
            threads.push(
                thread::Builder::new()
                    .name(format!("daemon-worker-{id}"))
                    .spawn(move || worker_loop(&*wire, rx, &interrupted, latency))?,
            );
        }

        Ok(Self { threads })
    }

    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn interrupt_target(frame: &[u8]) -> Option<u64> {
    let (hdr, payload) = InHeader::read_from_prefix(frame).ok()?;
    if hdr.opcode != Opcode::Interrupt as u32 {
        return None;
    }
    InterruptIn::read_from_prefix(payload)
        .ok()
        .map(|(int, _)| int.unique)
}

fn note_interrupt(interrupted: &Mutex<HashSet<u64>>, target: u64) {
    if let Ok(mut set) = interrupted.lock() {
        set.insert(target);
    }
}

fn take_interrupt(interrupted: &Mutex<HashSet<u64>>, unique: u64) -> bool {
    interrupted
        .lock()
        .map(|mut set| set.remove(&unique))
        .unwrap_or(false)
}

fn worker_loop(
    wire: &dyn Wire,
    rx: Receiver<Vec<u8>>,
    interrupted: &Mutex<HashSet<u64>>,
    latency: Duration,
) {
    while let Ok(frame) = rx.recv() {
        let Ok((hdr, payload)) = InHeader::read_from_prefix(&frame) else {
            tracing::error!(target: TARGET, len = frame.len(), "short request");
            continue;
        };
        let Ok(opcode) = Opcode::try_from(hdr.opcode) else {
            tracing::error!(target: TARGET, opcode = hdr.opcode, "unknown opcode");
            continue;
        };
        if !opcode.expects_reply() {
            continue;
        }

        if !latency.is_zero() && opcode != Opcode::Init {
            thread::sleep(latency);
        }

        let (error, body) = if take_interrupt(interrupted, hdr.unique) {
            (-libc::EINTR, Vec::new())
        } else {
            answer(opcode, &hdr, payload)
        };

        let out = OutHeader {
            len: (OUT_HEADER_SIZE + body.len()) as u32,
            error,
            unique: hdr.unique,
        };
        let mut msg = Vec::with_capacity(out.len as usize);
        msg.extend_from_slice(out.as_bytes());
        msg.extend_from_slice(&body);
        if let Err(err) = wire.send(&msg) {
            tracing::debug!(target: TARGET, error = %err, "answer not delivered");
            break;
        }
    }
}

/// Build the answer for one request: `(negated errno, body)`.
fn answer(opcode: Opcode, hdr: &InHeader, payload: &[u8]) -> (i32, Vec<u8>) {
    match opcode {
        Opcode::Init => {
            let flags = InitIn::read_from_prefix(payload)
                .map(|(init, _)| init.flags)
                .unwrap_or(0);
            let out = InitOut {
                major: 7,
                minor: 28,
                max_readahead: 128 * 1024,
                flags,
                max_write: 128 * 1024,
                time_gran: 1,
                ..Default::default()
            };
            (0, out.as_bytes().to_vec())
        }
        Opcode::Getattr => {
            let mut out = AttrOut::default();
            out.attr.ino = hdr.nodeid;
            out.attr.mode = libc::S_IFREG | 0o644;
            out.attr.nlink = 1;
            (0, out.as_bytes().to_vec())
        }
        Opcode::Lookup => {
            let name = payload.split(|b| *b == 0).next().unwrap_or_default();
            let nodeid = name
                .iter()
                .fold(hdr.nodeid, |h, b| h.wrapping_mul(31).wrapping_add(*b as u64));
            let mut out = EntryOut {
                nodeid,
                ..Default::default()
            };
            out.attr.ino = nodeid;
            (0, out.as_bytes().to_vec())
        }
        Opcode::Open | Opcode::Opendir => (0, OpenOut::default().as_bytes().to_vec()),
        Opcode::Read | Opcode::Readdir => {
            let size = ReadIn::read_from_prefix(payload)
                .map(|(read, _)| read.size as usize)
                .unwrap_or(0);
            (0, vec![0x5a; size.min(MAX_READ_ANSWER)])
        }
        Opcode::Write => {
            let out = WriteOut {
                size: payload.len().saturating_sub(WRITE_IN_SIZE) as u32,
                padding: 0,
            };
            (0, out.as_bytes().to_vec())
        }
        Opcode::Release | Opcode::Releasedir | Opcode::Flush => (0, Vec::new()),
        _ => (-libc::ENOSYS, Vec::new()),
    }
}
