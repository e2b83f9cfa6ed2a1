//! End-to-end scenarios driven over in-memory duplex streams (standing in
//! for the relay) and loopback TCP/UDP sockets (standing in for redirected
//! traffic). Each test below corresponds to one of the numbered end-to-end
//! scenarios documented for this crate's ACL/mux/proxy interaction.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rshuttle_core::acl::AclTables;
use rshuttle_core::listeners::dns::{self, DnsBypass, DnsFlows};
use rshuttle_core::listeners::tcp::{self, AcceptOutcome};
use rshuttle_core::listeners::udp::{self, UdpFlows};
use rshuttle_core::listeners::OriginLookup;
use rshuttle_core::mux::Mux;
use rshuttle_core::session::{self, TcpFlowEntry, TcpFlows};
use rshuttle_core::wire::{Command, FrameHeader, HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// A stand-in for `SO_ORIGINAL_DST`: always reports the same destination,
/// regardless of which socket was accepted.
struct FixedDst(Mutex<SocketAddr>);

impl OriginLookup for FixedDst {
    fn original_dst(&self, _sock: &TcpStream) -> std::io::Result<SocketAddr> {
        Ok(*self.0.lock().unwrap())
    }
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let accept = listener.accept();
    let (connect, accept) = tokio::join!(connect, accept);
    (connect.unwrap(), accept.unwrap().0)
}

/// Reads one complete frame off `peer` and returns its command and payload.
async fn read_one_frame(peer: &mut tokio::io::DuplexStream) -> (Command, u16, Vec<u8>) {
    let mut hdr_buf = [0u8; HEADER_LEN];
    peer.read_exact(&mut hdr_buf).await.unwrap();
    let hdr = FrameHeader::parse(&hdr_buf).unwrap();
    let mut payload = vec![0u8; hdr.length() as usize];
    if !payload.is_empty() {
        peer.read_exact(&mut payload).await.unwrap();
    }
    (hdr.command().unwrap(), hdr.channel(), payload)
}

#[tokio::test]
async fn scenario_1_allow_tcp_connects_and_proxies_bytes() {
    let tables = AclTables::new();
    let src: SocketAddr = "10.0.0.5:51515".parse().unwrap();
    let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
    tables.set_allowed_sources({
        let mut m = std::collections::HashMap::new();
        m.insert(src.ip(), i64::MAX);
        m
    });
    tables.set_allowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("0.0.0.0/0".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });
    let tables = Arc::new(tables);

    let (relay_side, mut peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);

    let (client, accepted) = tcp_pair().await;
    let origin = FixedDst(Mutex::new(dst));

    let outcome = tcp::handle_accept(
        accepted,
        src,
        0,
        |_| false,
        &origin,
        &tables,
        &mut mux,
        0,
    )
    .await;

    let AcceptOutcome::Spawned { channel, dst: got_dst, .. } = outcome else {
        panic!("expected the flow to be spawned");
    };
    assert_eq!(got_dst, dst);

    // Drive one tick to flush the queued TCP_CONNECT frame, then read it
    // off the relay side. The tick completes synchronously (the duplex has
    // plenty of capacity) so there's no need to race it against the read.
    mux.tick().await.unwrap();
    let (cmd, chan, payload) = read_one_frame(&mut peer).await;
    assert_eq!(cmd, Command::TcpConnect);
    assert_eq!(chan, channel);
    assert_eq!(payload, b"2,93.184.216.34,80");

    // Bytes written by the client should reach the relay as TCP_DATA on the
    // same channel. The duplex buffer is large enough that the write
    // completes without the proxy task having drained anything yet, so it's
    // safe to await it fully before polling the mux for the resulting frame.
    let mut client = client;
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut got_data = false;
    for _ in 0..50 {
        tokio::select! {
            _ = mux.tick() => {}
            frame = read_one_frame(&mut peer) => {
                let (cmd, _chan, payload) = frame;
                if cmd == Command::TcpData {
                    assert!(payload.windows(3).any(|w| w == b"GET"));
                    got_data = true;
                    break;
                }
            }
        }
    }
    assert!(got_data, "expected a TCP_DATA frame carrying the request bytes");
}

#[tokio::test]
async fn scenario_2_deny_by_target_closes_without_connect() {
    let tables = AclTables::new();
    let src: SocketAddr = "10.0.0.5:51515".parse().unwrap();
    let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
    tables.set_allowed_sources({
        let mut m = std::collections::HashMap::new();
        m.insert(src.ip(), i64::MAX);
        m
    });
    tables.set_allowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("0.0.0.0/0".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });
    tables.set_disallowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("93.184.216.0/24".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });
    let tables = Arc::new(tables);

    let (relay_side, _peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);
    let (_client, accepted) = tcp_pair().await;
    let origin = FixedDst(Mutex::new(dst));

    let outcome = tcp::handle_accept(accepted, src, 0, |_| false, &origin, &tables, &mut mux, 0).await;
    assert!(matches!(outcome, AcceptOutcome::Denied));
    assert_eq!(mux.active_channels(), 0);
}

#[tokio::test]
async fn scenario_3_expired_source_lease_denies() {
    let tables = AclTables::new();
    let src: SocketAddr = "10.0.0.5:51515".parse().unwrap();
    let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
    tables.set_allowed_sources({
        let mut m = std::collections::HashMap::new();
        m.insert(src.ip(), session::now_epoch_ms() - 1);
        m
    });
    tables.set_allowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("0.0.0.0/0".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });
    let tables = Arc::new(tables);

    let (relay_side, _peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);
    let (_client, accepted) = tcp_pair().await;
    let origin = FixedDst(Mutex::new(dst));

    let outcome = tcp::handle_accept(
        accepted,
        src,
        0,
        |_| false,
        &origin,
        &tables,
        &mut mux,
        session::now_epoch_ms(),
    )
    .await;
    assert!(matches!(outcome, AcceptOutcome::Denied));
}

#[tokio::test]
async fn scenario_4_policy_change_revokes_a_live_flow() {
    let tables = AclTables::new();
    let src: SocketAddr = "10.0.0.5:51515".parse().unwrap();
    let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
    tables.set_allowed_sources({
        let mut m = std::collections::HashMap::new();
        m.insert(src.ip(), i64::MAX);
        m
    });
    tables.set_allowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("0.0.0.0/0".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });
    let tables = Arc::new(tables);

    let (relay_side, _peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);
    let (_client, accepted) = tcp_pair().await;
    let origin = FixedDst(Mutex::new(dst));

    let outcome = tcp::handle_accept(accepted, src, 0, |_| false, &origin, &tables, &mut mux, 0).await;
    let AcceptOutcome::Spawned { channel, dst, task } = outcome else {
        panic!("expected the flow to be spawned");
    };

    let mut flows = TcpFlows::new();
    flows.push(TcpFlowEntry { src, dst, channel, task });
    assert_eq!(flows.len(), 1);

    // Policy changes: the destination's /24 is now disallowed.
    tables.set_disallowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("93.184.216.0/24".parse().unwrap(), vec!["80".parse().unwrap()]);
        m
    });

    flows.expire(&tables, &mut mux, 0);
    assert_eq!(flows.len(), 0, "the revoked flow must be torn down");
    assert_eq!(mux.active_channels(), 0, "its channel must be freed");
}

#[tokio::test(start_paused = false)]
async fn scenario_5_dns_suffix_bypass_skips_the_relay() {
    let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = fake_server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        if let Ok((n, from)) = fake_server.recv_from(&mut buf).await {
            let _ = fake_server.send_to(b"FAKE-DNS-RESPONSE", from).await;
            let _ = n;
        }
    });

    let client_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let src = client_sock.local_addr().unwrap();
    let our_listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let dst = our_listener.local_addr().unwrap();

    let mut bypass = DnsBypass {
        suffixes: vec!["corp.local".to_string()],
        preferred: Some(fake_addr),
        fallback: Some("127.0.0.1:1".parse().unwrap()),
    };

    let (relay_side, _peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);
    let mut flows = DnsFlows::new();

    let query = encode_dns_query("host.corp.local");
    dns::handle_datagram(
        src,
        dst,
        query,
        our_listener.clone(),
        &mut bypass,
        &mut mux,
        &mut flows,
        Instant::now(),
    )
    .await;

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client_sock.recv_from(&mut buf))
        .await
        .expect("client should receive a direct DNS reply")
        .unwrap();
    assert_eq!(&buf[..n], b"FAKE-DNS-RESPONSE");
    assert_eq!(flows.len(), 0, "bypassed queries never get a relay channel");
    assert_eq!(mux.active_channels(), 0);
}

#[tokio::test]
async fn scenario_6_udp_idle_expiry_emits_exactly_one_close() {
    let tables = AclTables::new();
    let src: SocketAddr = "10.0.0.9:40000".parse().unwrap();
    let dst: SocketAddr = "198.51.100.1:53".parse().unwrap();
    tables.set_allowed_sources({
        let mut m = std::collections::HashMap::new();
        m.insert(src.ip(), i64::MAX);
        m
    });
    tables.set_allowed_targets({
        let mut m = std::collections::HashMap::new();
        m.insert("0.0.0.0/0".parse().unwrap(), vec!["53".parse().unwrap()]);
        m
    });

    let (relay_side, mut peer) = tokio::io::duplex(8192);
    let (mut mux, _handle) = Mux::new(relay_side);
    let mut flows = UdpFlows::new();
    let reply_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    let now = Instant::now();
    udp::handle_datagram(src, dst, b"\x00\x01", reply_sock, &tables, &mut mux, &mut flows, now, 0);
    assert_eq!(flows.len(), 1);

    // Drain the UDP_OPEN frame the first datagram generates. The tick
    // completes synchronously here (duplex has plenty of capacity), so
    // awaiting it directly instead of racing it against the read avoids
    // leaving the frame undrained in the pipe.
    mux.tick().await.unwrap();
    let (cmd, _chan, _payload) = read_one_frame(&mut peer).await;
    assert_eq!(cmd, Command::UdpOpen);

    let later = now + udp::UDP_IDLE_TIMEOUT + Duration::from_millis(1);
    flows.expire(later, &mut mux);
    assert_eq!(flows.len(), 0, "expired source must be removed from udp_by_src");

    mux.tick().await.unwrap();
    let (cmd, _chan, _payload) = read_one_frame(&mut peer).await;
    assert_eq!(cmd, Command::UdpClose);
}

/// Hand-rolled single-question DNS query: header + QNAME labels + QTYPE=A,
/// QCLASS=IN.
fn encode_dns_query(name: &str) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    out[0] = 0x12;
    out[1] = 0x34;
    out[2] = 0x01; // RD
    out[5] = 0x01; // QDCOUNT = 1
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    out.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    out
}
