//! Unsolicited notifications from the daemon.
//!
//! A message whose header carries unique id 0 is not an answer. Its `error`
//! field holds a [`NotifyCode`] and the body the code's payload. Only cache
//! invalidations are understood; everything else is refused with
//! [`IpcError::UnsupportedNotification`] and the session stays alive.

use crate::error::{IpcError, ProtocolError};
use crate::protocol::abi::{NotifyInvalEntryOut, NotifyInvalInodeOut, NAME_MAX};
use crate::protocol::NotifyCode;
use crate::session::Session;
use std::mem::size_of;
use zerocopy::FromBytes;

/// Receiver for cache invalidations pushed by the daemon.
pub trait Notifier: Send + Sync {
    /// Drop cached data for `inval.ino` in `[off, off + len)`; a negative
    /// offset asks for attributes only.
    fn inval_inode(&self, inval: NotifyInvalInodeOut);

    /// Drop the cached entry `name` under `parent`.
    fn inval_entry(&self, parent: u64, name: &[u8]);
}

/// Logs notifications and otherwise ignores them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn inval_inode(&self, inval: NotifyInvalInodeOut) {
        tracing::debug!(
            target: "fuse-ipc::device",
            ino = inval.ino,
            off = inval.off,
            len = inval.len,
            "inval_inode"
        );
    }

    fn inval_entry(&self, parent: u64, name: &[u8]) {
        tracing::debug!(
            target: "fuse-ipc::device",
            parent,
            name = %String::from_utf8_lossy(name),
            "inval_entry"
        );
    }
}

fn bad(code: i32, reason: &'static str) -> IpcError {
    ProtocolError::BadNotification { code, reason }.into()
}

/// Validate a notification and hand it to the session's [`Notifier`].
pub(crate) fn deliver(session: &Session, code: i32, body: &[u8]) -> Result<(), IpcError> {
    session.counters().notification();
    match NotifyCode::try_from(code) {
        Ok(NotifyCode::InvalInode) => {
            let inval = NotifyInvalInodeOut::read_from_bytes(body)
                .map_err(|_| bad(code, "wrong payload size"))?;
            session.notifier().inval_inode(inval);
            Ok(())
        }
        Ok(NotifyCode::InvalEntry) => {
            let (hdr, rest) = NotifyInvalEntryOut::read_from_prefix(body)
                .map_err(|_| bad(code, "short payload"))?;
            let namelen = hdr.namelen as usize;
            if namelen > NAME_MAX {
                return Err(bad(code, "name too long"));
            }
            if rest.len() != namelen + 1 {
                return Err(bad(code, "payload size does not match name length"));
            }
            if rest[namelen] != 0 {
                return Err(bad(code, "name not NUL terminated"));
            }
            debug_assert_eq!(body.len(), size_of::<NotifyInvalEntryOut>() + namelen + 1);
            session.notifier().inval_entry(hdr.parent, &rest[..namelen]);
            Ok(())
        }
        _ => {
            tracing::debug!(target: "fuse-ipc::device", code, "unsupported notification");
            Err(IpcError::UnsupportedNotification(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use std::sync::{Arc, Mutex};
    use zerocopy::IntoBytes;

    #[derive(Default)]
    struct Recorder {
        inodes: Mutex<Vec<u64>>,
        entries: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    struct Shared(Arc<Recorder>);

    impl Notifier for Shared {
        fn inval_inode(&self, inval: NotifyInvalInodeOut) {
            self.0.inodes.lock().unwrap().push(inval.ino);
        }

        fn inval_entry(&self, parent: u64, name: &[u8]) {
            self.0.entries.lock().unwrap().push((parent, name.to_vec()));
        }
    }

    fn session() -> (Arc<Session>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session =
            Session::with_notifier(SessionConfig::new(), Box::new(Shared(Arc::clone(&recorder))));
        (session, recorder)
    }

    fn entry_payload(parent: u64, name: &[u8], namelen: u32, terminator: u8) -> Vec<u8> {
        let hdr = NotifyInvalEntryOut {
            parent,
            namelen,
            padding: 0,
        };
        let mut body = hdr.as_bytes().to_vec();
        body.extend_from_slice(name);
        body.push(terminator);
        body
    }

    #[test]
    fn test_inval_inode() {
        let (session, recorder) = session();
        let inval = NotifyInvalInodeOut {
            ino: 42,
            off: 0,
            len: -1,
        };
        deliver(&session, NotifyCode::InvalInode as i32, inval.as_bytes()).unwrap();
        assert_eq!(*recorder.inodes.lock().unwrap(), vec![42]);

        let err = deliver(&session, NotifyCode::InvalInode as i32, &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::BadNotification { .. })
        ));
    }

    #[test]
    fn test_inval_entry() {
        let (session, recorder) = session();
        let body = entry_payload(7, b"name", 4, 0);
        deliver(&session, NotifyCode::InvalEntry as i32, &body).unwrap();
        assert_eq!(
            *recorder.entries.lock().unwrap(),
            vec![(7, b"name".to_vec())]
        );
    }

    #[test]
    fn test_inval_entry_rejects_malformed() {
        let (session, recorder) = session();
        let code = NotifyCode::InvalEntry as i32;
        assert!(deliver(&session, code, &entry_payload(7, b"name", 4, b'x')).is_err());
        assert!(deliver(&session, code, &entry_payload(7, b"name", 5, 0)).is_err());
        assert!(deliver(&session, code, &entry_payload(7, b"name", 3, 0)).is_err());
        assert!(deliver(&session, code, &[0u8; 4]).is_err());

        let long = vec![b'a'; NAME_MAX + 1];
        assert!(deliver(&session, code, &entry_payload(7, &long, long.len() as u32, 0)).is_err());
        assert!(recorder.entries.lock().unwrap().is_empty());
        assert!(!session.is_dead());
    }

    #[test]
    fn test_unsupported_codes() {
        let (session, _) = session();
        for code in [1, 4, 5, 6, 99] {
            assert!(matches!(
                deliver(&session, code, &[]),
                Err(IpcError::UnsupportedNotification(c)) if c == code
            ));
        }
        assert!(!session.is_dead());
    }
}
