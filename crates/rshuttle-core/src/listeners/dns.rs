//! DNS accept path: suffix-bypass direct resolution against a pair of
//! "preferred" upstream servers, falling back to the relay for everything
//! else (and for the bypass servers themselves, when both are down).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::mux::{ChannelMessage, Mux};
use crate::wire::Command;

pub const DNS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DnsListeners {
    v6: Option<Arc<UdpSocket>>,
    v4: Option<Arc<UdpSocket>>,
}

impl DnsListeners {
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

/// State for the suffix-bypass path: two directly-queryable upstream
/// servers and the DNS name suffixes that route to them instead of the
/// relay. `preferred`/`fallback` swap places whenever `preferred` fails to
/// answer, exactly as `client.py`'s module-level `preferreddns`/
/// `notpreferreddns` globals do.
#[derive(Debug, Clone)]
pub struct DnsBypass {
    pub suffixes: Vec<String>,
    pub preferred: Option<SocketAddr>,
    pub fallback: Option<SocketAddr>,
}

impl DnsBypass {
    pub fn matches(&self, qname: &str) -> bool {
        self.preferred.is_some()
            && self.fallback.is_some()
            && self.suffixes.iter().any(|s| qname.ends_with(s.as_str()))
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.preferred, &mut self.fallback);
    }
}

struct PendingDns {
    deadline: Instant,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct DnsFlows {
    pending: HashMap<u16, PendingDns>,
}

impl DnsFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reap every channel whose response already arrived (its relay task
    /// finished) or whose 30s deadline passed without one, in which case
    /// the channel is closed without ever answering the client.
    pub fn expire(&mut self, now: Instant, mux: &mut Mux) {
        let done: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.task.is_finished() || p.deadline < now)
            .map(|(chan, _)| *chan)
            .collect();
        for chan in done {
            if let Some(p) = self.pending.remove(&chan) {
                if p.task.is_finished() {
                    debug!(channel = chan, "DNS response delivered, freeing channel");
                } else {
                    debug!(channel = chan, "expiring DNS request with no response");
                    p.task.abort();
                }
                mux.unregister(chan);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One DNS query arrived at `dst` from `src` on `reply_sock`. Mirrors
/// `ondns`: suffix matches query the bypass servers directly (with
/// preferred/fallback swap on failure), everything else forwards to the
/// relay over a fresh mux channel whose single expected response is
/// relayed straight back to `src`.
pub async fn handle_datagram(
    src: SocketAddr,
    dst: SocketAddr,
    data: Vec<u8>,
    reply_sock: Arc<UdpSocket>,
    bypass: &mut DnsBypass,
    mux: &mut Mux,
    flows: &mut DnsFlows,
    now: Instant,
) {
    let qname = Message::from_bytes(&data)
        .ok()
        .and_then(|m| m.queries().first().map(|q| q.name().to_utf8()));

    if let Some(qname) = &qname {
        if bypass.matches(qname) {
            if try_direct_resolve(&data, bypass.preferred.unwrap(), &reply_sock, src).await {
                return;
            }
            bypass.swap();
            debug!(prior = ?bypass.fallback, now = ?bypass.preferred, "preferred DNS server failed, swapping");
            if try_direct_resolve(&data, bypass.preferred.unwrap(), &reply_sock, src).await {
                return;
            }
            debug!("both bypass DNS servers unreachable, falling back to relay");
        }
    }

    let Some(channel) = mux.next_channel() else {
        warn!("too many open channels, discarded DNS request");
        return;
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChannelMessage>();
    mux.register(channel, tx);
    mux.send(channel, Command::DnsReq, data);

    let task = tokio::spawn(async move {
        if let Some((Command::DnsResponse, response)) = rx.recv().await {
            if let Err(e) = reply_sock.send_to(&response, src).await {
                debug!(error = %e, %src, "failed to relay DNS response");
            }
        }
    });
    flows.pending.insert(channel, PendingDns { deadline: now + DNS_REQUEST_TIMEOUT, task });
}

async fn try_direct_resolve(query: &[u8], upstream: SocketAddr, reply_sock: &UdpSocket, reply_to: SocketAddr) -> bool {
    let local_addr = if upstream.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let sock = match UdpSocket::bind(local_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to open local socket for direct DNS resolution");
            return false;
        }
    };
    if sock.send_to(query, upstream).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 4096];
    let recv = tokio::time::timeout(UPSTREAM_QUERY_TIMEOUT, sock.recv_from(&mut buf)).await;
    match recv {
        Ok(Ok((n, _))) => {
            let _ = reply_sock.send_to(&buf[..n], reply_to).await;
            true
        }
        _ => false,
    }
}
