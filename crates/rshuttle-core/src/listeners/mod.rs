//! Dual-stack listeners and kernel redirect-destination recovery.

mod origin;
pub mod dns;
pub mod tcp;
pub mod udp;

pub use origin::{LinuxOriginLookup, OriginLookup};

use std::io;
use std::net::SocketAddr;

/// A spare, pre-opened file descriptor held in reserve so that when
/// `accept()` fails with `EMFILE`/`ENFILE` we can close it, accept (and
/// immediately drop) the pending connection to clear it off the listen
/// backlog, then reopen the spare. Mirrors `client.py`'s `_extra_fd`
/// `/dev/null` trick.
pub struct SpareFd {
    file: Option<std::fs::File>,
}

impl SpareFd {
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            file: Some(std::fs::File::open("/dev/null")?),
        })
    }

    /// Release the spare fd so a blocked `accept()` has room to succeed.
    /// Call [`Self::reopen`] once the shed-accept has run and freed that
    /// room back up.
    pub fn release(&mut self) {
        self.file.take();
    }

    /// Reopen the spare fd after a shed-accept has cleared the pending
    /// connection that triggered `EMFILE`/`ENFILE`.
    pub fn reopen(&mut self) {
        match std::fs::File::open("/dev/null") {
            Ok(f) => self.file = Some(f),
            Err(e) => tracing::warn!(error = %e, "failed to reopen spare fd after shedding a connection"),
        }
    }
}

pub(crate) fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE
    )
}

/// True if `addr` is one of this process's own listening addresses on the
/// same address family — used to reject a redirected connection that would
/// otherwise loop back into this same proxy (`client.py`'s "that's my
/// address!" check).
pub fn is_own_listen_address(addr: SocketAddr, own_port: u16, is_local_ip: impl Fn(std::net::IpAddr) -> bool) -> bool {
    addr.port() == own_port && is_local_ip(addr.ip())
}
