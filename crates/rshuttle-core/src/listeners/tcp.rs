//! TCP accept path: dual-stack listener, FD-exhaustion shedding, ACL gate,
//! original-destination recovery, and handing the new flow off to a
//! [`Proxy`](crate::proxy::Proxy).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::origin::OriginLookup;
use super::{is_fd_exhaustion, is_own_listen_address, SpareFd};
use crate::acl::AclTables;
use crate::mux::Mux;
use crate::proxy::Proxy;
use crate::wire::{tcp_connect_payload, Command};
use crate::wrapper::{FlowEnd, MuxWrapper, SockWrapper};

pub struct TcpListeners {
    v6: Option<TcpListener>,
    v4: Option<TcpListener>,
    spare_fd: SpareFd,
}

impl TcpListeners {
    /// Bind the requested stacks. A v4 bind failing with `EADDRINUSE` after
    /// a successful v6 bind is swallowed: the dual-stack v6 socket already
    /// accepts v4-mapped connections on that port.
    pub async fn bind(v6: Option<SocketAddr>, v4: Option<SocketAddr>, backlog: u32) -> io::Result<Self> {
        let v6_listener = match v6 {
            Some(addr) => Some(bind_listener(addr, backlog).await?),
            None => None,
        };
        let v4_listener = match v4 {
            Some(addr) => match bind_listener(addr, backlog).await {
                Ok(l) => Some(l),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && v6_listener.is_some() => {
                    debug!("v4 TCP bind on {addr} hit EADDRINUSE with v6 already bound, dropping v4 listener");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        if let Some(l) = &v6_listener {
            info!(addr = %l.local_addr()?, "TCP listener bound (v6)");
        }
        if let Some(l) = &v4_listener {
            info!(addr = %l.local_addr()?, "TCP listener bound (v4)");
        }
        Ok(Self {
            v6: v6_listener,
            v4: v4_listener,
            spare_fd: SpareFd::open()?,
        })
    }

    pub fn is_bound(&self, family_v6: bool) -> bool {
        if family_v6 {
            self.v6.is_some()
        } else {
            self.v4.is_some()
        }
    }

    /// Accept the next connection on whichever stack is ready first. On
    /// `EMFILE`/`ENFILE`, sheds one pending connection using the spare fd
    /// trick and returns `Ok(None)` so the caller just loops back around.
    pub async fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let result = match (&self.v6, &self.v4) {
            (Some(v6), Some(v4)) => {
                tokio::select! {
                    r = v6.accept() => r,
                    r = v4.accept() => r,
                }
            }
            (Some(v6), None) => v6.accept().await,
            (None, Some(v4)) => v4.accept().await,
            (None, None) => std::future::pending().await,
        };

        match result {
            Ok((sock, addr)) => Ok(Some((sock, addr))),
            Err(e) if is_fd_exhaustion(&e) => {
                warn!("rejected incoming TCP connection: too many open files");
                self.spare_fd.release();
                if let Some(v6) = &self.v6 {
                    if let Ok((sock, _)) = v6.accept().await {
                        drop(sock);
                    }
                } else if let Some(v4) = &self.v4 {
                    if let Ok((sock, _)) = v4.accept().await {
                        drop(sock);
                    }
                }
                self.spare_fd.reopen();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

async fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Outcome of an accept decision, used by the event loop to decide whether
/// a new flow task needs tracking.
pub enum AcceptOutcome {
    Denied,
    Looped,
    Spawned {
        channel: u16,
        dst: SocketAddr,
        task: tokio::task::JoinHandle<()>,
    },
}

/// Port recovery, ACL gate, channel allocation and `Proxy` spawn for one
/// newly-accepted TCP connection. Mirrors `onaccept_tcp` in the reference
/// implementation.
#[allow(clippy::too_many_arguments)]
pub async fn handle_accept(
    sock: TcpStream,
    src: SocketAddr,
    own_port: u16,
    is_local_ip: impl Fn(std::net::IpAddr) -> bool,
    origin: &dyn OriginLookup,
    tables: &Arc<AclTables>,
    mux: &mut Mux,
    now_epoch_ms: i64,
) -> AcceptOutcome {
    let dst = match origin.original_dst(&sock) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to recover original destination, dropping connection");
            return AcceptOutcome::Denied;
        }
    };

    if is_own_listen_address(dst, own_port, is_local_ip) {
        debug!("ignored: that's our own listening address");
        return AcceptOutcome::Looped;
    }

    if !tables
        .snapshot()
        .connection_is_allowed(dst.ip(), dst.port(), src.ip(), now_epoch_ms)
    {
        debug!(%src, %dst, "deny TCP");
        return AcceptOutcome::Denied;
    }

    info!(%src, %dst, "accept TCP");

    let Some(channel) = mux.next_channel() else {
        warn!("too many open channels, discarded connection");
        return AcceptOutcome::Denied;
    };

    let family = if dst.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    mux.send(channel, Command::TcpConnect, tcp_connect_payload(family, dst.ip(), dst.port()));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    mux.register(channel, tx);

    let proxy = Proxy::new(
        FlowEnd::Sock(SockWrapper::new(sock)),
        FlowEnd::Mux(MuxWrapper::new(channel, mux.handle(), rx)),
    );
    let task = tokio::spawn(proxy.run());

    AcceptOutcome::Spawned { channel, dst, task }
}
