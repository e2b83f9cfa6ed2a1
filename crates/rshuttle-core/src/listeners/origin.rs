//! Recovering a redirected TCP connection's original destination.
//!
//! The kernel rewrites the destination address of a REDIRECTed connection
//! before handing it to `accept()`; `getsockname()` on the accepted socket
//! then returns the *redirect* target, not where the client actually tried
//! to connect. `SO_ORIGINAL_DST` asks the kernel (specifically, the
//! netfilter conntrack entry for the connection) for the real destination.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;

use tokio::net::TcpStream;

const SO_ORIGINAL_DST: libc::c_int = 80;
const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Recovers the pre-redirect destination of an accepted connection. A
/// trait boundary (rather than a free function) so tests can substitute a
/// fake that doesn't depend on having real REDIRECT/TPROXY rules installed.
pub trait OriginLookup: Send + Sync {
    fn original_dst(&self, sock: &TcpStream) -> io::Result<SocketAddr>;
}

/// Linux `getsockopt(SOL_IP, SO_ORIGINAL_DST)` / `getsockopt(SOL_IPV6,
/// IP6T_SO_ORIGINAL_DST)` lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxOriginLookup;

impl OriginLookup for LinuxOriginLookup {
    fn original_dst(&self, sock: &TcpStream) -> io::Result<SocketAddr> {
        let local = sock.local_addr()?;
        match local {
            SocketAddr::V4(_) => original_dst_v4(sock),
            SocketAddr::V6(_) => original_dst_v6(sock),
        }
    }
}

fn original_dst_v4(sock: &TcpStream) -> io::Result<SocketAddr> {
    // SAFETY: `sockaddr_in` is a plain-old-data struct; getsockopt writes at
    // most `len` bytes into it and we pass its exact size. `fd` stays valid
    // for the duration of the call since `sock` outlives it.
    unsafe {
        let fd = sock.as_raw_fd();
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }
}

fn original_dst_v6(sock: &TcpStream) -> io::Result<SocketAddr> {
    // SAFETY: same reasoning as `original_dst_v4`, for the v6 sockaddr shape.
    unsafe {
        let fd = sock.as_raw_fd();
        let mut addr: libc::sockaddr_in6 = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            IP6T_SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        let port = u16::from_be(addr.sin6_port);
        Ok(SocketAddr::new(IpAddr::V6(ip), port))
    }
}
