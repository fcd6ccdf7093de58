//! Cancellation of queued and delivered requests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{recv, Fixture};
use fuse_ipc::protocol::abi::{AttrOut, InterruptIn};
use fuse_ipc::{CancelToken, IpcError, Opcode, SessionConfig};
use zerocopy::{FromBytes, IntoBytes};

fn interruptible() -> Fixture {
    Fixture::with_config(SessionConfig::new().allow_interrupt(true))
}

fn interrupt_target(req: &common::Request) -> u64 {
    assert_eq!(req.opcode(), Opcode::Interrupt);
    InterruptIn::read_from_prefix(&req.payload).unwrap().0.unique
}

#[test]
fn test_cancel_before_delivery_never_reaches_daemon() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Getattr, 1, vec![0u8; 16], Some(Arc::clone(&token)));
    fx.wait_queued(1);
    token.interrupt();

    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert!(fx.try_read_request().is_none());
    assert!(fx.session.registry().is_empty());
    assert_eq!(fx.session.stats().interrupts_sent, 0);
}

#[test]
fn test_interrupt_delivered_request() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Getattr, 3, vec![0u8; 16], Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();

    let interrupt = fx.read_request();
    assert_eq!(interrupt_target(&interrupt), original.unique());
    assert_ne!(interrupt.unique(), original.unique());
    assert_eq!(interrupt.header.nodeid, 3);
    assert_eq!(interrupt.header.pid, original.header.pid);

    // The daemon gives up on the original; the pending interrupt is retired.
    fx.reply(original.unique(), -libc::EINTR, &[]).unwrap();
    assert!(matches!(recv(&rx), Err(IpcError::Daemon(libc::EINTR))));
    assert!(fx.session.registry().is_empty());
    assert_eq!(fx.session.stats().interrupts_sent, 1);

    // A late answer to the retired interrupt is a stale echo.
    fx.reply(interrupt.unique(), -libc::EAGAIN, &[]).unwrap();
    assert_eq!(fx.session.stats().stale_interrupt_echoes, 1);
    assert!(!fx.session.is_dead());
}

#[test]
fn test_interrupted_request_can_still_succeed() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Getattr, 3, vec![0u8; 16], Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();
    let _interrupt = fx.read_request();

    let mut out = AttrOut::default();
    out.attr.ino = 3;
    fx.reply(original.unique(), 0, out.as_bytes()).unwrap();
    let body = recv(&rx).unwrap();
    assert_eq!(AttrOut::read_from_prefix(&body).unwrap().0.attr.ino, 3);
}

#[test]
fn test_interrupt_enosys_disables_interrupts() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();
    let interrupt = fx.read_request();

    fx.reply(interrupt.unique(), -libc::ENOSYS, &[]).unwrap();
    assert!(!fx.session.maybe_impl(Opcode::Interrupt));

    fx.reply(original.unique(), 0, b"link").unwrap();
    assert_eq!(recv(&rx).unwrap(), b"link");

    // Cancellation is now ignored: nothing is sent and the call waits for
    // its answer.
    let token = Arc::new(CancelToken::new());
    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let req = fx.read_request();
    token.interrupt();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(fx.try_read_request().is_none());
    fx.reply(req.unique(), 0, b"again").unwrap();
    assert_eq!(recv(&rx).unwrap(), b"again");
}

#[test]
fn test_interrupt_eagain_is_resent() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();
    let first = fx.read_request();

    fx.reply(first.unique(), -libc::EAGAIN, &[]).unwrap();
    let second = fx.read_request();
    assert_eq!(interrupt_target(&second), original.unique());
    assert_ne!(second.unique(), first.unique());
    assert_eq!(fx.session.stats().interrupts_sent, 2);

    fx.reply(original.unique(), -libc::EINTR, &[]).unwrap();
    assert!(matches!(recv(&rx), Err(IpcError::Daemon(libc::EINTR))));
    assert!(fx.session.registry().is_empty());
}

#[test]
fn test_unexpected_interrupt_answer_is_not_fatal() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();
    let interrupt = fx.read_request();

    let err = fx.reply(interrupt.unique(), -libc::EPERM, &[]).unwrap_err();
    assert!(matches!(
        err,
        IpcError::Protocol(fuse_ipc::ProtocolError::BadInterruptReply(libc::EPERM))
    ));
    assert!(!fx.session.is_dead());

    fx.reply(original.unique(), 0, b"ok").unwrap();
    assert_eq!(recv(&rx).unwrap(), b"ok");
}

#[test]
fn test_second_signal_returns_immediately() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.interrupt();
    let interrupt = fx.read_request();
    assert_eq!(interrupt_target(&interrupt), original.unique());

    token.interrupt();
    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert_eq!(token.signals(), 2);

    // The daemon's eventual answer is absorbed.
    fx.reply(original.unique(), 0, b"late").unwrap();
    assert!(fx.session.registry().is_empty());
}

#[test]
fn test_kill_returns_without_interrupt() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();
    token.kill();

    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert!(token.is_killed());
    assert!(fx.try_read_request().is_none());
    fx.reply(original.unique(), 0, b"late").unwrap();
}

#[test]
fn test_kill_before_delivery_never_reaches_daemon() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Getattr, 1, vec![0u8; 16], Some(Arc::clone(&token)));
    fx.wait_queued(1);
    token.kill();

    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert!(fx.try_read_request().is_none());
    assert!(fx.session.queue().is_empty());
    assert!(fx.session.registry().is_empty());
    assert_eq!(fx.session.stats().interrupts_sent, 0);
}

#[test]
fn test_kill_honoured_without_intr_option() {
    let fx = Fixture::new();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let req = fx.read_request();
    token.kill();

    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert!(fx.try_read_request().is_none());

    // The daemon's answer is absorbed without a handler.
    fx.reply(req.unique(), 0, b"late").unwrap();
    assert!(fx.session.registry().is_empty());
}

#[test]
fn test_kill_before_delivery_without_intr_option() {
    let fx = Fixture::new();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Getattr, 1, vec![0u8; 16], Some(Arc::clone(&token)));
    fx.wait_queued(1);
    token.kill();

    assert!(matches!(recv(&rx), Err(IpcError::Interrupted)));
    assert!(fx.try_read_request().is_none());
    assert!(fx.session.registry().is_empty());
}

#[test]
fn test_cancel_ignored_without_intr_option() {
    let fx = Fixture::new();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let req = fx.read_request();
    token.interrupt();

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(fx.try_read_request().is_none());
    fx.reply(req.unique(), 0, b"done").unwrap();
    assert_eq!(recv(&rx).unwrap(), b"done");
}

#[test]
fn test_interrupt_precedes_queued_requests() {
    let fx = interruptible();
    let token = Arc::new(CancelToken::new());

    let rx = fx.spawn_call(Opcode::Readlink, 1, Vec::new(), Some(Arc::clone(&token)));
    let original = fx.read_request();

    let _others: Vec<_> = (0..3)
        .map(|_| fx.spawn_call(Opcode::Getattr, 2, vec![0u8; 16], None))
        .collect();
    fx.wait_queued(3);
    token.interrupt();
    fx.wait_queued(4);

    let next = fx.read_request();
    assert_eq!(interrupt_target(&next), original.unique());
    for _ in 0..3 {
        assert_eq!(fx.read_request().opcode(), Opcode::Getattr);
    }

    fx.session.destroy();
    assert!(matches!(recv(&rx), Err(IpcError::ConnectionClosed)));
}
