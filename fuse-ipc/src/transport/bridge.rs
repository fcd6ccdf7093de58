//! Thread pair pumping a [`Device`] over a [`DuplexStream`].

use super::{read_frame, DuplexStream};
use crate::device::Device;
use crate::error::IpcError;
use crate::protocol::MAX_MESSAGE_SIZE;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const STACK_SIZE: usize = 512 * 1024;

/// Handles of the two bridge threads.
///
/// Both threads exit once the session dies or the stream closes; dropping
/// the `Bridge` detaches them.
pub struct Bridge {
    requests: JoinHandle<()>,
    answers: JoinHandle<()>,
}

impl Bridge {
    /// Wait for both threads to exit.
    pub fn join(self) {
        let _ = self.requests.join();
        let _ = self.answers.join();
    }

    pub fn is_finished(&self) -> bool {
        self.requests.is_finished() && self.answers.is_finished()
    }
}

/// Connect `device` to `stream`.
///
/// One thread reads queued requests from the device and writes them to the
/// stream; the other reads answer frames from the stream and writes them to
/// the device. The session is marked dead when the stream closes, and the
/// stream is shut down when the session dies.
pub fn bridge<S: DuplexStream>(device: Arc<Device>, stream: S) -> io::Result<Bridge> {
    let answer_stream = stream.try_clone()?;
    let request_stream = stream;

    // The request pump parks in `Device::read`.
    device.set_nonblocking(false);

    let request_device = Arc::clone(&device);
    let requests = thread::Builder::new()
        .name("fuse-ipc-requests".to_string())
        .stack_size(STACK_SIZE)
        .spawn(move || request_loop(&request_device, request_stream))?;

    let answer_device = Arc::clone(&device);
    let answers = thread::Builder::new()
        .name("fuse-ipc-answers".to_string())
        .stack_size(STACK_SIZE)
        .spawn(move || answer_loop(&answer_device, answer_stream));
    let answers = match answers {
        Ok(handle) => handle,
        Err(err) => {
            // Unblocks the request pump.
            device.session().mark_dead();
            return Err(err);
        }
    };

    Ok(Bridge { requests, answers })
}

/// Device -> stream.
fn request_loop<S: DuplexStream>(device: &Device, mut stream: S) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut count = 0u64;

    loop {
        let len = match device.read(&mut buf) {
            Ok(len) => len,
            Err(IpcError::ConnectionClosed) => break,
            Err(err) => {
                tracing::error!(target: "fuse-ipc::transport", error = %err, "request read failed");
                break;
            }
        };
        if let Err(err) = stream.write_all(&buf[..len]).and_then(|()| stream.flush()) {
            tracing::warn!(
                target: "fuse-ipc::transport",
                count,
                error = %err,
                error_kind = ?err.kind(),
                "stream write failed"
            );
            device.session().mark_dead();
            break;
        }
        count += 1;
    }

    // Wakes the answer pump if it is parked in a read.
    let _ = stream.shutdown();
    tracing::info!(target: "fuse-ipc::transport", count, "request pump exiting");
}

/// Stream -> device.
fn answer_loop<S: DuplexStream>(device: &Device, mut stream: S) {
    let mut count = 0u64;

    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::info!(target: "fuse-ipc::transport", count, "stream closed");
                break;
            }
            Err(err) => {
                tracing::warn!(
                    target: "fuse-ipc::transport",
                    count,
                    error = %err,
                    "stream read failed"
                );
                break;
            }
        };
        count += 1;

        match device.write(&frame) {
            Ok(_) => {}
            Err(IpcError::ConnectionClosed) => break,
            // Logged and counted by the device; a fatal one kills the session.
            Err(_) if device.session().is_dead() => break,
            Err(_) => {}
        }
    }

    device.session().mark_dead();
    tracing::info!(target: "fuse-ipc::transport", count, "answer pump exiting");
}
