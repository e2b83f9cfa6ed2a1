//! UDP accept path: one mux channel per source address, reused and kept
//! alive on an idle deadline refreshed by every further datagram.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::acl::AclTables;
use crate::mux::{ChannelMessage, Mux};
use crate::wire::{parse_udp_data, udp_data_payload, udp_open_payload, Command};

/// Idle timeout for a per-source UDP channel: refreshed on every datagram
/// from that source, matching `client.py`'s `udp_by_src` 30s lease.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UdpListeners {
    v6: Option<Arc<UdpSocket>>,
    v4: Option<Arc<UdpSocket>>,
}

impl UdpListeners {
    pub async fn bind(v6: Option<SocketAddr>, v4: Option<SocketAddr>) -> io::Result<Self> {
        let v6_sock = match v6 {
            Some(addr) => Some(Arc::new(UdpSocket::bind(addr).await?)),
            None => None,
        };
        let v4_sock = match v4 {
            Some(addr) => match UdpSocket::bind(addr).await {
                Ok(s) => Some(Arc::new(s)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && v6_sock.is_some() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        Ok(Self { v6: v6_sock, v4: v4_sock })
    }

    /// Receive the next datagram, along with the socket it arrived on (so
    /// the caller can reply through the same stack).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Arc<UdpSocket>)> {
        match (&self.v6, &self.v4) {
            (Some(v6), Some(v4)) => {
                tokio::select! {
                    r = v6.recv_from(buf) => r.map(|(n, a)| (n, a, v6.clone())),
                    r = v4.recv_from(buf) => r.map(|(n, a)| (n, a, v4.clone())),
                }
            }
            (Some(v6), None) => v6.recv_from(buf).await.map(|(n, a)| (n, a, v6.clone())),
            (None, Some(v4)) => v4.recv_from(buf).await.map(|(n, a)| (n, a, v4.clone())),
            (None, None) => std::future::pending().await,
        }
    }
}

/// Per-source UDP channel bookkeeping, owned by the session manager.
#[derive(Default)]
pub struct UdpFlows {
    by_src: HashMap<SocketAddr, (u16, Instant)>,
}

impl UdpFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop and announce closure (`UDP_CLOSE`) for every channel whose idle
    /// deadline has passed.
    pub fn expire(&mut self, now: Instant, mux: &mut Mux) {
        let expired: Vec<SocketAddr> = self
            .by_src
            .iter()
            .filter(|(_, (_, deadline))| *deadline < now)
            .map(|(src, _)| *src)
            .collect();
        for src in expired {
            if let Some((chan, _)) = self.by_src.remove(&src) {
                debug!(channel = chan, %src, "expiring UDP channel");
                mux.send(chan, Command::UdpClose, Vec::new());
                mux.unregister(chan);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_src.len()
    }
}

/// One UDP datagram arrived at `dst` from `src` on `reply_sock`. Allocates
/// a channel (and sends `UDP_OPEN`, spawning a reader that relays
/// responses back to `src` through `reply_sock`) the first time this
/// source is seen, otherwise reuses the existing one and refreshes its
/// idle deadline. Mirrors `onaccept_udp` / `udp_done`.
#[allow(clippy::too_many_arguments)]
pub fn handle_datagram(
    src: SocketAddr,
    dst: SocketAddr,
    data: &[u8],
    reply_sock: Arc<UdpSocket>,
    tables: &AclTables,
    mux: &mut Mux,
    flows: &mut UdpFlows,
    now: Instant,
    now_epoch_ms: i64,
) {
    if !tables
        .snapshot()
        .connection_is_allowed(dst.ip(), dst.port(), src.ip(), now_epoch_ms)
    {
        debug!(%src, %dst, "deny UDP");
        return;
    }

    let channel = match flows.by_src.get(&src).map(|(c, _)| *c) {
        Some(c) => c,
        None => {
            let Some(c) = mux.next_channel() else {
                warn!("too many open channels, discarded UDP datagram");
                return;
            };
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChannelMessage>();
            mux.register(c, tx);
            let family = if src.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
            mux.send(c, Command::UdpOpen, udp_open_payload(family));

            tokio::spawn(async move {
                while let Some((cmd, payload)) = rx.recv().await {
                    if cmd != Command::UdpData {
                        continue;
                    }
                    match parse_udp_data(&payload) {
                        Ok((_from, raw)) => {
                            if let Err(e) = reply_sock.send_to(raw, src).await {
                                debug!(error = %e, %src, "failed to relay UDP reply");
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed UDP_DATA frame from relay"),
                    }
                }
            });
            c
        }
    };
    flows.by_src.insert(src, (channel, now + UDP_IDLE_TIMEOUT));
    mux.send(channel, Command::UdpData, udp_data_payload(dst, data));
}
