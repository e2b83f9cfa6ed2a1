//! Session manager: startup handshake sequence and the flow registries the
//! event loop drives on every tick.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::acl::AclTables;
use crate::config::{Config, PORT_SEARCH_END, PORT_SEARCH_START};
use crate::error::{Error, Result};
use crate::firewall::{FirewallClient, Nameserver, PortAssignments, RouteSpec};
use crate::listeners::dns::DnsListeners;
use crate::listeners::tcp::TcpListeners;
use crate::listeners::udp::UdpListeners;
use crate::mux::Mux;
use crate::wire::Command as WireCommand;

const RELAY_INIT_STRING: &[u8] = b"SSHUTTLE0001";

/// Current time as Unix-epoch milliseconds, for comparing against ACL
/// lease expiries.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A bookkept TCP flow: who it's from/to and the task pumping it.
pub struct TcpFlowEntry {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub channel: u16,
    pub task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct TcpFlows {
    entries: Vec<TcpFlowEntry>,
}

impl TcpFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TcpFlowEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop flows whose source is no longer ACL-allowed or whose pump task
    /// has already finished, aborting the still-running ones among them.
    /// Mirrors the source-expiry half of `expire_connections`.
    pub fn expire(&mut self, tables: &AclTables, mux: &mut Mux, now_epoch_ms: i64) {
        let mut i = 0;
        while i < self.entries.len() {
            let finished = self.entries[i].task.is_finished();
            let still_allowed = tables.snapshot().connection_is_allowed(
                self.entries[i].dst.ip(),
                self.entries[i].dst.port(),
                self.entries[i].src.ip(),
                now_epoch_ms,
            );
            if finished || !still_allowed {
                let entry = self.entries.swap_remove(i);
                if !finished {
                    debug!(channel = entry.channel, src = %entry.src, "tearing down TCP flow: source no longer allowed");
                    entry.task.abort();
                }
                mux.unregister(entry.channel);
            } else {
                i += 1;
            }
        }
    }
}

/// Search `PORT_SEARCH_START` down to `PORT_SEARCH_END` (inclusive),
/// calling `attempt(port)` for each candidate and stopping at the first
/// one that doesn't fail with `AddrInUse`. Matches `client.py`'s
/// `range(12300, 9000, -1)` search.
pub async fn find_port<F, Fut, T>(mut attempt: F) -> Result<(u16, T)>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut last_err = None;
    let mut port = PORT_SEARCH_START;
    loop {
        match attempt(port).await {
            Ok(bound) => return Ok((port, bound)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => last_err = Some(e),
            Err(e) => return Err(Error::Io(e)),
        }
        if port == PORT_SEARCH_END {
            break;
        }
        port -= 1;
    }
    Err(Error::FatalStartup(format!(
        "no free port in {PORT_SEARCH_START}..={PORT_SEARCH_END}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Everything needed to run the event loop: the relay process and its
/// mux, the bound listeners, ACL tables, and the flow registries.
pub struct Session {
    pub config: Config,
    pub relay_process: Child,
    pub mux: Mux,
    pub firewall: FirewallClient,
    pub tcp_listeners: TcpListeners,
    pub udp_listeners: Option<UdpListeners>,
    pub dns_listeners: Option<DnsListeners>,
    pub tables: Arc<AclTables>,
    pub tcp_flows: TcpFlows,
}

impl Session {
    /// Run the full startup sequence: spawn the firewall helper, bind
    /// listeners by port search, complete the `ROUTES`/`NSLIST`/`PORTS`/`GO`
    /// handshake, spawn the relay and complete its init-string handshake,
    /// then seed hostnames.
    pub async fn start(config: Config, tables: Arc<AclTables>) -> Result<Self> {
        config.validate()?;

        let mut firewall = FirewallClient::spawn(&config.firewall_argv).await?;
        info!(method = %firewall.method, "firewall helper ready");

        let want_udp = config.udp_enabled;
        let want_dns = !config.nameservers.is_empty();

        let (port, (tcp_listeners, udp_listeners)) = find_port(|port| {
            let listen_v6 = bind_addr(config.listen_v6, port);
            let listen_v4 = bind_addr(config.listen_v4, port);
            async move {
                let tcp = TcpListeners::bind(listen_v6, listen_v4, 10).await?;
                let udp = if want_udp {
                    Some(UdpListeners::bind(listen_v6, listen_v4).await?)
                } else {
                    None
                };
                Ok::<_, io::Error>((tcp, udp))
            }
        })
        .await?;
        let redirect_port = port;

        let (dns_port, dns_listeners) = if want_dns {
            let (p, l) = find_port(|port| {
                let listen_v6 = config.listen_v6.map(|a| SocketAddr::new(a.ip(), port));
                let listen_v4 = config.listen_v4.map(|a| SocketAddr::new(a.ip(), port));
                async move { DnsListeners::bind(listen_v6, listen_v4).await }
            })
            .await?;
            (p, Some(l))
        } else {
            (0, None)
        };

        let routes: Vec<RouteSpec> = config
            .subnets_include
            .iter()
            .map(|s| RouteSpec {
                family: s.family,
                ip: s.ip,
                width: s.width,
                exclude: false,
            })
            .chain(config.subnets_exclude.iter().map(|s| RouteSpec {
                family: s.family,
                ip: s.ip,
                width: s.width,
                exclude: true,
            }))
            .collect();
        let nameservers: Vec<Nameserver> = config
            .nameservers
            .iter()
            .map(|ip| Nameserver {
                family: if ip.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET },
                ip: *ip,
            })
            .collect();
        let redirect_v6 = if tcp_listeners.is_bound(true) { redirect_port } else { 0 };
        let redirect_v4 = if tcp_listeners.is_bound(false) { redirect_port } else { 0 };
        let dns_v6 = if dns_listeners.is_some() { dns_port } else { 0 };
        let dns_v4 = dns_v6;

        firewall
            .start(
                &routes,
                &nameservers,
                &PortAssignments {
                    redirect_v6,
                    redirect_v4,
                    dns_v6,
                    dns_v4,
                },
                want_udp,
            )
            .await?;

        let (mut relay_process, mux) = spawn_relay_and_handshake(&config.relay_command).await?;
        info!("connected to relay");

        if !config.seed_hosts.is_empty() {
            let handle = mux.handle();
            handle.send(
                0,
                WireCommand::HostReq,
                config.seed_hosts.join("\n").into_bytes(),
            );
        }

        Ok(Self {
            config,
            relay_process,
            mux,
            firewall,
            tcp_listeners,
            udp_listeners,
            dns_listeners,
            tables,
            tcp_flows: TcpFlows::new(),
        })
    }
}

fn bind_addr(base: Option<SocketAddr>, port: u16) -> Option<SocketAddr> {
    base.map(|a| SocketAddr::new(a.ip(), if a.port() != 0 { a.port() } else { port }))
}

/// Spawn the relay shell client, consume its two-NUL-delimited-fields-
/// then-fixed-length-init-string handshake directly off the raw stdout
/// (mirroring the reference implementation reading straight off the
/// socket before the mux ever issues a read), then wrap the remaining
/// stdin/stdout pair as the mux's duplex stream.
async fn spawn_relay_and_handshake(command: &[String]) -> Result<(Child, Mux)> {
    use tokio::io::AsyncReadExt;

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::FatalStartup(format!("failed to spawn relay: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::FatalStartup("relay child has no stdin".into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::FatalStartup("relay child has no stdout".into()))?;

    for _ in 0..2 {
        loop {
            let mut byte = [0u8; 1];
            let n = stdout.read(&mut byte).await.map_err(Error::Io)?;
            if n == 0 || byte[0] == 0 {
                break;
            }
        }
    }

    let mut initstring = vec![0u8; RELAY_INIT_STRING.len()];
    stdout.read_exact(&mut initstring).await.map_err(Error::Io)?;

    if let Ok(Some(status)) = child.try_wait() {
        return Err(Error::FatalStartup(format!("relay died with status {status}")));
    }
    if initstring != RELAY_INIT_STRING {
        return Err(Error::FatalStartup(format!(
            "expected relay init string {:?}, got {:?}",
            String::from_utf8_lossy(RELAY_INIT_STRING),
            String::from_utf8_lossy(&initstring)
        )));
    }

    let duplex = tokio::io::join(stdout, stdin);
    let (mux, _handle) = Mux::new(duplex);
    Ok((child, mux))
}

/// `ROUTES` control-channel callback: track auto-discovered nets for a
/// later firewall `start()` call. Resolves the REDESIGN FLAG in `spec.md`
/// §9 by requiring each family's TCP listener to actually be bound before
/// accepting a route for that family, symmetrically for v6 and v4 (the
/// original's `else` branch applied this check to v4 only; not
/// reproduced).
pub fn parse_routes(body: &[u8], v6_bound: bool, v4_bound: bool) -> Vec<(i32, IpAddr, u8)> {
    let mut out = Vec::new();
    let text = String::from_utf8_lossy(body);
    for line in text.trim().lines() {
        let mut parts = line.splitn(3, ',');
        let (Some(family), Some(ip), Some(width)) = (parts.next(), parts.next(), parts.next()) else {
            warn!(%line, "malformed ROUTES line, skipping");
            continue;
        };
        let (Ok(family), Ok(ip), Ok(width)) = (
            family.parse::<i32>(),
            ip.parse::<IpAddr>(),
            width.parse::<u8>(),
        ) else {
            warn!(%line, "malformed ROUTES line, skipping");
            continue;
        };
        let bound = if family == libc::AF_INET6 { v6_bound } else { v4_bound };
        if !bound {
            debug!(family, %ip, width, "ignored auto net: listener not bound for this family");
            continue;
        }
        out.push((family, ip, width));
    }
    out
}

/// `HOST_LIST` control-channel callback: parse `name,ip` pairs.
pub fn parse_host_list(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    text.trim()
        .split_whitespace()
        .filter_map(|entry| entry.split_once(','))
        .map(|(name, ip)| (name.to_string(), ip.to_string()))
        .collect()
}

/// Idle interval the event loop uses to drive `expire_connections`; no
/// longer than 100ms per `spec.md` §4.4.
pub const EXPIRE_INTERVAL: Duration = Duration::from_millis(100);

pub fn monotonic_now() -> Instant {
    Instant::now()
}
