//! `FUSE_INIT` handshake.
//!
//! The session advertises protocol 7.28 and learns the daemon's version,
//! limits and feature flags from the answer. Opcodes introduced after the
//! daemon's minor version are recorded as not implemented so callers never
//! send them.

use crate::dispatch::{encode_request, Credentials};
use crate::error::{IpcError, ProtocolError};
use crate::protocol::abi::{InitIn, InitOut, COMPAT_22_INIT_OUT_SIZE};
use crate::protocol::{
    audit, AbiVersion, InitFlags, Opcode, KERNEL_MINOR_VERSION, KERNEL_VERSION,
};
use crate::session::{Session, SessionFlags};
use crate::ticket::{Fault, ResponseHandler, TicketRef};
use std::mem::size_of;
use std::sync::Arc;
use zerocopy::FromBytes;

/// `max_write` assumed for daemons older than 7.5.
const COMPAT_MAX_WRITE: u32 = 4096;

/// Largest accepted timestamp granularity, in nanoseconds.
const MAX_TIME_GRAN: u32 = 1_000_000_000;

/// Opcodes a daemon older than the given minor version cannot implement.
const INTRODUCED_IN: [(Opcode, u32); 6] = [
    (Opcode::Interrupt, 7),
    (Opcode::Bmap, 8),
    (Opcode::Destroy, 8),
    (Opcode::Fallocate, 19),
    (Opcode::Lseek, 24),
    (Opcode::CopyFileRange, 28),
];

impl Session {
    /// Queue the handshake request. Does not wait for the answer; see
    /// [`Session::wait_init`].
    pub fn send_init(&self) -> Result<(), IpcError> {
        let init = InitIn {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: self.capabilities().max_readahead,
            flags: self.config().init_flags.bits(),
        };
        let ticket = self.activate();
        {
            let mut state = ticket.lock();
            encode_request(
                &mut state,
                Opcode::Init,
                ticket.unique(),
                0,
                Credentials::current(),
                &init,
            );
            state.handler = Some(Arc::new(InitHandler));
        }
        if !self.register(&ticket) {
            return Err(IpcError::ConnectionClosed);
        }
        self.enqueue(&ticket, false);
        tracing::info!(
            target: "fuse-ipc::init",
            version = %AbiVersion::new(KERNEL_VERSION, KERNEL_MINOR_VERSION),
            max_readahead = init.max_readahead,
            flags = ?self.config().init_flags,
            "init sent"
        );
        Ok(())
    }
}

/// Records the negotiated capabilities from the `FUSE_INIT` answer.
pub(crate) struct InitHandler;

impl InitHandler {
    fn negotiate(session: &Session, body: &[u8]) -> Result<(), ProtocolError> {
        audit(Opcode::Init, AbiVersion::new(KERNEL_VERSION, 0), None, body.len())?;

        // Shorter variants are prefixes of the full structure.
        let mut raw = [0u8; size_of::<InitOut>()];
        raw[..body.len()].copy_from_slice(body);
        let out = InitOut::read_from_bytes(&raw[..])
            .map_err(|_| ProtocolError::BadInitReply(body.len()))?;

        let abi = AbiVersion::new(out.major, out.minor);
        if !abi.at_least(7, 4) {
            return Err(ProtocolError::UnsupportedVersion {
                major: out.major,
                minor: out.minor,
            });
        }
        let full = body.len() == size_of::<InitOut>();
        if abi.at_least(7, 5) && !(full || body.len() == COMPAT_22_INIT_OUT_SIZE) {
            return Err(ProtocolError::BadInitReply(body.len()));
        }

        let requested = session.config().init_flags;
        session.update_capabilities(|caps| {
            caps.abi = abi;
            if abi.at_least(7, 5) {
                caps.max_write = out.max_write;
                let granted = InitFlags::from_bits_truncate(out.flags) & requested;
                for (init_flag, session_flag) in [
                    (InitFlags::ASYNC_READ, SessionFlags::ASYNC_READ),
                    (InitFlags::POSIX_LOCKS, SessionFlags::POSIX_LOCKS),
                    (InitFlags::EXPORT_SUPPORT, SessionFlags::EXPORT_SUPPORT),
                ] {
                    caps.flags.set(session_flag, granted.contains(init_flag));
                }
            } else {
                caps.max_write = COMPAT_MAX_WRITE;
            }
            if abi.at_least(7, 6) {
                caps.max_readahead = caps.max_readahead.min(out.max_readahead);
            }
            caps.time_gran = if abi.at_least(7, 23) && (1..=MAX_TIME_GRAN).contains(&out.time_gran)
            {
                out.time_gran
            } else {
                1
            };
        });

        for (opcode, minor) in INTRODUCED_IN {
            if !abi.at_least(7, minor) {
                session.set_not_impl(opcode);
            }
        }

        let caps = session.capabilities();
        tracing::info!(
            target: "fuse-ipc::init",
            version = %abi,
            max_write = caps.max_write,
            max_readahead = caps.max_readahead,
            time_gran = caps.time_gran,
            flags = ?caps.flags,
            "init complete"
        );
        Ok(())
    }
}

impl ResponseHandler for InitHandler {
    fn on_answer(
        &self,
        session: &Session,
        ticket: &TicketRef,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut state = ticket.lock();
        let errno = state.errno;
        let negotiated = if errno == 0 {
            Self::negotiate(session, body)
        } else {
            Ok(())
        };
        let fault = negotiated.is_err().then_some(Fault::BadResponse);
        ticket.resolve(&mut state, fault);
        drop(state);

        if errno != 0 {
            tracing::error!(target: "fuse-ipc::init", errno, "daemon rejected init");
            session.mark_dead();
        } else if let Err(err) = &negotiated {
            tracing::error!(target: "fuse-ipc::init", error = %err, "init failed");
            session.mark_dead();
        }
        session.mark_inited();
        negotiated
    }
}
