//! `FUSE_INTERRUPT`: cancelling a request the daemon may already hold.
//!
//! A request still in the outbound queue is cancelled locally and never
//! reaches the daemon. A delivered request gets a companion interrupt
//! ticket, queued urgently and correlated through the original's
//! `interrupt_unique`. The daemon answers the interrupt with:
//!
//! - `ENOSYS`: interrupts are recorded as unsupported for the session
//! - `EAGAIN`: it saw the interrupt before the original; interrupt again
//! - anything else: a protocol error
//!
//! When the original is answered first, the device write path retires the
//! interrupt ticket (see `Device::write`).

use crate::dispatch::{encode_request, Credentials};
use crate::error::ProtocolError;
use crate::protocol::abi::InterruptIn;
use crate::protocol::Opcode;
use crate::session::Session;
use crate::ticket::{Fault, ResponseHandler, TicketRef};
use std::sync::Arc;
use zerocopy::FromBytes;

/// Cancel `ticket`, completing it with `reason` if it was never delivered.
pub fn send(session: &Session, ticket: &TicketRef, reason: Fault) {
    if ticket.interrupt_unique() != 0 || ticket.is_completed() {
        return;
    }

    if let Some(queued) = session.queue().unqueue(ticket) {
        ticket.complete(Some(reason));
        queued.release();
        if let Some(registered) = session.registry().remove(ticket) {
            registered.release();
        }
        tracing::debug!(
            target: "fuse-ipc::interrupt",
            unique = ticket.unique(),
            "cancelled before delivery"
        );
        return;
    }

    if !session.maybe_impl(Opcode::Interrupt) {
        return;
    }
    let Some(original) = ticket.lock().in_header() else {
        return;
    };

    let itick = session.activate();
    if !ticket.try_set_interrupt_unique(itick.unique()) {
        return;
    }
    {
        let mut state = itick.lock();
        let payload = InterruptIn {
            unique: ticket.unique(),
        };
        encode_request(
            &mut state,
            Opcode::Interrupt,
            itick.unique(),
            original.nodeid,
            Credentials {
                pid: original.pid,
                uid: original.uid,
                gid: original.gid,
            },
            &payload,
        );
        state.handler = Some(Arc::new(InterruptHandler));
    }

    if !session.register(&itick) {
        ticket.clear_interrupt_unique(itick.unique());
        return;
    }
    session.enqueue(&itick, true);
    session.counters().interrupt_sent();
    tracing::debug!(
        target: "fuse-ipc::interrupt",
        unique = ticket.unique(),
        interrupt = itick.unique(),
        "interrupt queued"
    );
}

/// Handles the daemon's answer to an interrupt ticket.
pub(crate) struct InterruptHandler;

impl ResponseHandler for InterruptHandler {
    fn on_answer(
        &self,
        session: &Session,
        itick: &TicketRef,
        _body: &[u8],
    ) -> Result<(), ProtocolError> {
        let (errno, target) = {
            let state = itick.lock();
            let target = InterruptIn::read_from_prefix(state.request_payload())
                .map(|(payload, _)| payload.unique)
                .unwrap_or(0);
            (state.errno, target)
        };

        let result = if errno == libc::ENOSYS {
            tracing::info!(
                target: "fuse-ipc::interrupt",
                "daemon does not implement interrupts"
            );
            session.set_not_impl(Opcode::Interrupt);
            if let Some(original) = session.registry().find(target) {
                original.clear_interrupt_unique(itick.unique());
            }
            Ok(())
        } else {
            match session.registry().find(target) {
                // Already answered; nothing left to reconcile.
                None => Ok(()),
                Some(original) => {
                    original.clear_interrupt_unique(itick.unique());
                    match errno {
                        libc::EAGAIN => {
                            tracing::debug!(
                                target: "fuse-ipc::interrupt",
                                unique = original.unique(),
                                "daemon asked to interrupt again"
                            );
                            send(session, &original, Fault::Interrupted);
                            Ok(())
                        }
                        other => Err(ProtocolError::BadInterruptReply(other)),
                    }
                }
            }
        };

        itick.complete(None);
        result
    }
}
