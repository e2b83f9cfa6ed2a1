//! The main `tokio::select!` loop: relay liveness, mux I/O, listener
//! readiness, and periodic connection expiry all converge here.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::listeners::dns::{self, DnsBypass, DnsFlows};
use crate::listeners::tcp::{self, AcceptOutcome};
use crate::listeners::udp;
use crate::listeners::LinuxOriginLookup;
use crate::session::{self, Session, TcpFlowEntry};
use crate::wire::Command;

/// Runs the session to completion. Returns only on a fatal error (relay
/// died, relay stream closed) — per-flow and policy-deny conditions are
/// handled inline and never unwind out of here.
pub async fn run(mut session: Session, dns_bypass: Option<DnsBypass>) -> Result<()> {
    let mut dns_bypass = dns_bypass.unwrap_or(DnsBypass { suffixes: Vec::new(), preferred: None, fallback: None });
    let origin = LinuxOriginLookup;
    let own_port_v6 = session.config.listen_v6.map(|a| a.port()).unwrap_or(0);
    let own_port_v4 = session.config.listen_v4.map(|a| a.port()).unwrap_or(0);
    let local_v6 = session.config.listen_v6.map(|a| a.ip());
    let local_v4 = session.config.listen_v4.map(|a| a.ip());
    let v6_bound = session.tcp_listeners.is_bound(true);
    let v4_bound = session.tcp_listeners.is_bound(false);

    let mut control_rx = {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        session.mux.register(0, tx);
        rx
    };

    let mut udp_flows = udp::UdpFlows::new();
    let mut dns_flows = DnsFlows::new();

    let mut expire_timer = tokio::time::interval(session::EXPIRE_INTERVAL);
    let mut udp_buf = vec![0u8; 65536];
    let mut dns_buf = vec![0u8; 65536];

    loop {
        if let Ok(Some(status)) = session.relay_process.try_wait() {
            return Err(Error::FatalRuntime(format!("relay process exited: {status}")));
        }

        tokio::select! {
            tick = session.mux.tick() => {
                tick?;
            }

            Some((cmd, payload)) = control_rx.recv() => {
                handle_control_message(&mut session, cmd, payload, v6_bound, v4_bound).await;
            }

            accepted = session.tcp_listeners.accept() => {
                match accepted {
                    Ok(Some((sock, src))) => {
                        let now_ms = session::now_epoch_ms();
                        let own_port = if src.is_ipv6() { own_port_v6 } else { own_port_v4 };
                        let is_local_ip = |ip: std::net::IpAddr| Some(ip) == local_v6 || Some(ip) == local_v4;
                        let outcome = tcp::handle_accept(
                            sock,
                            src,
                            own_port,
                            is_local_ip,
                            &origin,
                            &session.tables,
                            &mut session.mux,
                            now_ms,
                        ).await;
                        if let AcceptOutcome::Spawned { channel, dst, task } = outcome {
                            session.tcp_flows.push(TcpFlowEntry { src, dst, channel, task });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                }
            }

            result = async {
                match session.udp_listeners.as_ref() {
                    Some(l) => l.recv(&mut udp_buf).await,
                    None => std::future::pending().await,
                }
            } => {
                match result {
                    Ok((n, src, sock)) => {
                        let now = session::monotonic_now();
                        let now_ms = session::now_epoch_ms();
                        match sock.local_addr() {
                            Ok(dst) => udp::handle_datagram(
                                src, dst, &udp_buf[..n], sock,
                                &session.tables, &mut session.mux, &mut udp_flows, now, now_ms,
                            ),
                            Err(e) => warn!(error = %e, "failed to read UDP local addr"),
                        }
                    }
                    Err(e) => warn!(error = %e, "UDP recv failed"),
                }
            }

            result = async {
                match session.dns_listeners.as_ref() {
                    Some(l) => l.recv(&mut dns_buf).await,
                    None => std::future::pending().await,
                }
            } => {
                match result {
                    Ok((n, src, sock)) => {
                        let now = session::monotonic_now();
                        match sock.local_addr() {
                            Ok(dst) => dns::handle_datagram(
                                src, dst, dns_buf[..n].to_vec(), sock,
                                &mut dns_bypass, &mut session.mux, &mut dns_flows, now,
                            ).await,
                            Err(e) => warn!(error = %e, "failed to read DNS local addr"),
                        }
                    }
                    Err(e) => warn!(error = %e, "DNS recv failed"),
                }
            }

            _ = expire_timer.tick() => {
                let now = session::monotonic_now();
                let now_ms = session::now_epoch_ms();
                session.tcp_flows.expire(&session.tables, &mut session.mux, now_ms);
                udp_flows.expire(now, &mut session.mux);
                dns_flows.expire(now, &mut session.mux);
                if session.config.latency_control && session.mux.is_full() {
                    warn!("mux backpressure engaged, pausing would-be new accepts this tick");
                }
            }
        }
    }
}

async fn handle_control_message(
    session: &mut Session,
    cmd: Command,
    payload: Vec<u8>,
    v6_bound: bool,
    v4_bound: bool,
) {
    match cmd {
        Command::Routes => {
            let routes = session::parse_routes(&payload, v6_bound, v4_bound);
            info!(count = routes.len(), "received ROUTES from relay");
        }
        Command::HostList => {
            let hosts = session::parse_host_list(&payload);
            for (name, ip) in hosts {
                match ip.parse() {
                    Ok(addr) => {
                        if let Err(e) = session.firewall.set_host_ip(&name, addr).await {
                            warn!(error = %e, %name, "failed to set host ip with firewall helper");
                        }
                    }
                    Err(_) => warn!(%name, %ip, "malformed host list entry, skipping"),
                }
            }
        }
        other => {
            warn!(?other, "unexpected command on control channel");
        }
    }
}
