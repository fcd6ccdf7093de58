//! Session configuration.

use crate::protocol::InitFlags;
use crate::ticket::IovPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time a caller waits for the daemon, in seconds.
pub const DEFAULT_DAEMON_TIMEOUT_SECS: u64 = 60;

/// Administrative bounds for the daemon timeout, in seconds.
pub const MIN_DAEMON_TIMEOUT_SECS: u64 = 1;
pub const MAX_DAEMON_TIMEOUT_SECS: u64 = 600;

/// Default largest request the session will read (128 KiB).
const DEFAULT_MAX_READ: u32 = 128 * 1024;

/// Configuration for one kernel/daemon session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a caller waits for an answer before giving up.
    pub daemon_timeout_secs: u64,

    /// Largest read the kernel side will issue.
    pub max_read: u32,

    /// Read-ahead requested in the handshake.
    pub max_readahead: u32,

    /// Let callers cancel in-flight requests (the `intr` mount option).
    pub allow_interrupt: bool,

    /// Daemon reports errors with Linux errno numbering.
    pub linux_errnos: bool,

    /// Flags requested in the handshake.
    pub init_flags: InitFlags,

    /// Buffer reclamation policy for pooled tickets.
    pub iov_policy: IovPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            daemon_timeout_secs: DEFAULT_DAEMON_TIMEOUT_SECS,
            max_read: DEFAULT_MAX_READ,
            max_readahead: DEFAULT_MAX_READ,
            allow_interrupt: false,
            linux_errnos: false,
            init_flags: InitFlags::ASYNC_READ
                | InitFlags::POSIX_LOCKS
                | InitFlags::EXPORT_SUPPORT
                | InitFlags::BIG_WRITES,
            iov_policy: IovPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the daemon timeout, clamped to the administrative bounds.
    pub fn daemon_timeout_secs(mut self, secs: u64) -> Self {
        self.daemon_timeout_secs = secs;
        self
    }

    pub fn max_read(mut self, bytes: u32) -> Self {
        self.max_read = bytes;
        self
    }

    pub fn max_readahead(mut self, bytes: u32) -> Self {
        self.max_readahead = bytes;
        self
    }

    pub fn allow_interrupt(mut self, allow: bool) -> Self {
        self.allow_interrupt = allow;
        self
    }

    pub fn linux_errnos(mut self, enabled: bool) -> Self {
        self.linux_errnos = enabled;
        self
    }

    pub fn init_flags(mut self, flags: InitFlags) -> Self {
        self.init_flags = flags;
        self
    }

    pub fn iov_policy(mut self, policy: IovPolicy) -> Self {
        self.iov_policy = policy;
        self
    }

    /// Effective daemon timeout after clamping.
    pub fn daemon_timeout(&self) -> Duration {
        Duration::from_secs(
            self.daemon_timeout_secs
                .clamp(MIN_DAEMON_TIMEOUT_SECS, MAX_DAEMON_TIMEOUT_SECS),
        )
    }
}
