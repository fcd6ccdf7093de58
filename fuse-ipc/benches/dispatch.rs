//! Request/answer round trip and body audit benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fuse_ipc::protocol::abi::{AttrOut, ReadIn};
use fuse_ipc::protocol::{audit, AbiVersion, InHeader, OUT_HEADER_SIZE};
use fuse_ipc::{Credentials, Device, Dispatch, Opcode, OutHeader, Session, SessionConfig};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use zerocopy::{FromBytes, IntoBytes};

/// Daemon thread answering getattr with a fixed attribute block and read
/// with as many bytes as requested.
fn spawn_daemon(device: Arc<Device>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; 1 << 20];
        let mut answer = Vec::with_capacity(1 << 20);
        let attr = AttrOut::default();
        while let Ok(len) = device.read(&mut buf) {
            let Ok((hdr, payload)) = InHeader::read_from_prefix(&buf[..len]) else {
                break;
            };
            let body: &[u8] = match Opcode::try_from(hdr.opcode) {
                Ok(Opcode::Read) => {
                    let size = ReadIn::read_from_prefix(payload)
                        .map(|(r, _)| r.size as usize)
                        .unwrap_or(0);
                    &buf[..size.min(buf.len())]
                }
                _ => attr.as_bytes(),
            };
            let out = OutHeader {
                len: (OUT_HEADER_SIZE + body.len()) as u32,
                error: 0,
                unique: hdr.unique,
            };
            answer.clear();
            answer.extend_from_slice(out.as_bytes());
            answer.extend_from_slice(body);
            if device.write(&answer).is_err() {
                break;
            }
        }
    })
}

fn bench_round_trip(c: &mut Criterion) {
    let session = Session::new(SessionConfig::new());
    let device = Arc::new(Device::new(Arc::clone(&session)));
    let daemon = spawn_daemon(device);
    let creds = Credentials::current();

    c.bench_function("round_trip/getattr", |b| {
        b.iter(|| {
            let answer = Dispatch::new(&session, Opcode::Getattr, 1, creds, 16)
                .wait_answer(None)
                .unwrap();
            black_box(answer.parse::<AttrOut>().unwrap())
        })
    });

    let mut group = c.benchmark_group("round_trip/read");
    for size in [4096u32, 65536] {
        let read_in = ReadIn {
            size,
            ..Default::default()
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}kb", size / 1024), |b| {
            b.iter(|| {
                let answer =
                    Dispatch::with_payload(&session, Opcode::Read, 1, creds, read_in.as_bytes())
                        .wait_answer(None)
                        .unwrap();
                black_box(answer.len())
            })
        });
    }
    group.finish();

    session.destroy();
    let _ = daemon.join();
}

fn bench_audit(c: &mut Criterion) {
    let abi = AbiVersion::new(7, 28);
    c.bench_function("audit/getattr", |b| {
        b.iter(|| audit(black_box(Opcode::Getattr), abi, None, black_box(104)))
    });
    c.bench_function("audit/read", |b| {
        b.iter(|| audit(black_box(Opcode::Read), abi, Some(65536), black_box(4096)))
    });
}

criterion_group!(benches, bench_round_trip, bench_audit);
criterion_main!(benches);
