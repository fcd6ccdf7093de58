//! Caller threads issuing a weighted mix of requests.

use crossbeam_channel::{unbounded, Sender};
use fuse_ipc::protocol::abi::ReadIn;
use fuse_ipc::{CancelToken, Credentials, Dispatch, IpcError, Opcode, Session};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zerocopy::IntoBytes;

/// Operations weighted by realistic FUSE usage
const WEIGHTS: &[(Opcode, u32)] = &[
    (Opcode::Getattr, 40),
    (Opcode::Lookup, 25),
    (Opcode::Read, 15),
    (Opcode::Readdir, 10),
    (Opcode::Write, 5),
    (Opcode::Getxattr, 5),
];

/// `fuse_getxattr_in` asking for the size of `user.x`.
const GETXATTR_PAYLOAD: &[u8] = b"\0\0\0\0\0\0\0\0user.x\0";

/// Delay before a cancellation is raised, so most land after delivery.
const CANCEL_DELAY: Duration = Duration::from_micros(20);

#[derive(Debug, Default, Serialize)]
pub struct ErrorBreakdown {
    pub interrupted: usize,
    pub timed_out: usize,
    pub not_implemented: usize,
    pub daemon: usize,
    pub closed: usize,
    pub other: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub ops_completed: usize,
    pub ok: usize,
    pub errors: ErrorBreakdown,
    pub duration_ms: u64,
}

pub fn run_worker(
    session: &Session,
    worker_id: usize,
    ops: usize,
    interrupt_every: usize,
) -> WorkerResult {
    let start = Instant::now();
    let creds = Credentials::current();
    let mut ok = 0usize;
    let mut errors = ErrorBreakdown::default();

    let mut op_list: Vec<Opcode> = Vec::with_capacity(100);
    for &(op, weight) in WEIGHTS {
        for _ in 0..weight {
            op_list.push(op);
        }
    }

    let canceller = (interrupt_every > 0).then(spawn_canceller);

    // Deterministic but varied sequence using worker_id as seed
    let mut rng_state = (worker_id as u64).wrapping_add(1);

    for i in 0..ops {
        if session.is_dead() {
            break;
        }
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let op = op_list[(rng_state >> 32) as usize % op_list.len()];
        let nodeid = 1 + (i % 16) as u64;

        let dispatch = match op {
            Opcode::Read | Opcode::Readdir => {
                let read_in = ReadIn {
                    size: 4096,
                    ..Default::default()
                };
                Dispatch::with_payload(session, op, nodeid, creds, read_in.as_bytes())
            }
            Opcode::Lookup => Dispatch::with_payload(
                session,
                op,
                nodeid,
                creds,
                format!("file-{}\0", i % 10).as_bytes(),
            ),
            Opcode::Write => Dispatch::new(session, op, nodeid, creds, 40 + 512),
            Opcode::Getxattr => {
                Dispatch::with_payload(session, op, nodeid, creds, GETXATTR_PAYLOAD)
            }
            _ => Dispatch::new(session, op, nodeid, creds, 16),
        };

        let token = match &canceller {
            Some(tx) if i % interrupt_every == 0 => {
                let token = Arc::new(CancelToken::new());
                let _ = tx.send(Arc::clone(&token));
                Some(token)
            }
            _ => None,
        };

        let started = Instant::now();
        let result = dispatch.wait_answer(token.as_deref());
        let latency_us = started.elapsed().as_micros() as f64;

        metrics::histogram!("stress.latency_us", "op" => op.name()).record(latency_us);
        metrics::counter!("stress.ops", "op" => op.name()).increment(1);

        match result {
            Ok(_) => ok += 1,
            Err(err) => {
                let kind = match err {
                    IpcError::Interrupted => {
                        errors.interrupted += 1;
                        "interrupted"
                    }
                    IpcError::TimedOut => {
                        errors.timed_out += 1;
                        "timed_out"
                    }
                    IpcError::NotImplemented(_) => {
                        errors.not_implemented += 1;
                        "not_implemented"
                    }
                    IpcError::Daemon(_) => {
                        errors.daemon += 1;
                        "daemon"
                    }
                    IpcError::ConnectionClosed => {
                        errors.closed += 1;
                        "closed"
                    }
                    _ => {
                        errors.other += 1;
                        "other"
                    }
                };
                metrics::counter!("stress.errors", "kind" => kind).increment(1);
                if errors.other <= 3 && kind == "other" {
                    tracing::warn!(worker_id, ?op, error = %err, "unexpected error");
                }
            }
        }
    }

    WorkerResult {
        worker_id,
        ops_completed: ok
            + errors.interrupted
            + errors.timed_out
            + errors.not_implemented
            + errors.daemon
            + errors.closed
            + errors.other,
        ok,
        errors,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Thread raising each received token shortly after it arrives.
fn spawn_canceller() -> Sender<Arc<CancelToken>> {
    let (tx, rx) = unbounded::<Arc<CancelToken>>();
    thread::spawn(move || {
        while let Ok(token) = rx.recv() {
            thread::sleep(CANCEL_DELAY);
            token.interrupt();
        }
    });
    tx
}
