//! Client side of the firewall helper's line-text protocol.
//!
//! The helper itself — the privileged process that actually installs NAT/
//! iptables (or nftables, pf, ...) rules — is an external collaborator
//! spawned over a Unix socketpair; this module only speaks its wire
//! protocol (`examples/original_source/sshuttle/methods/nat.py` implements
//! the other end, and stays out of scope here).

use std::net::IpAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// One network to route, matching the wire line `family,width,exclude,ip`.
pub struct RouteSpec {
    pub family: i32,
    pub ip: IpAddr,
    pub width: u8,
    pub exclude: bool,
}

/// One nameserver to intercept, matching the wire line `family,ip`.
pub struct Nameserver {
    pub family: i32,
    pub ip: IpAddr,
}

/// Port assignments sent in the single `PORTS` line.
pub struct PortAssignments {
    pub redirect_v6: u16,
    pub redirect_v4: u16,
    pub dns_v6: u16,
    pub dns_v4: u16,
}

/// A spawned firewall helper process plus the socketpair half used to
/// drive its line protocol.
pub struct FirewallClient {
    child: Child,
    read: BufReader<tokio::net::unix::OwnedReadHalf>,
    write: tokio::net::unix::OwnedWriteHalf,
    /// The method name the helper reported in its `READY <method>` line.
    pub method: String,
}

impl FirewallClient {
    /// Spawn `argv` (the helper binary and its `--firewall` invocation,
    /// already assembled by the caller including any `sudo` prefix) with
    /// one half of a socketpair wired to its stdin/stdout, and read its
    /// `READY <method>` banner.
    pub async fn spawn(argv: &[String]) -> Result<Self> {
        let (parent_half, child_half) = UnixStream::pair().map_err(Error::Io)?;
        let child_std = child_half
            .into_std()
            .map_err(Error::Io)?;
        child_std.set_nonblocking(false).map_err(Error::Io)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        // Duplicate the fd for stdout since `Stdio::from` takes ownership;
        // our half (`parent_half`) stays open for us to read/write
        // independently, mirroring the bound `socket.socketpair()` halves
        // in the reference implementation.
        let stdin_fd = child_std.try_clone().map_err(Error::Io)?;
        let stdout_fd = child_std.try_clone().map_err(Error::Io)?;
        cmd.stdin(std::process::Stdio::from(stdin_fd));
        cmd.stdout(std::process::Stdio::from(stdout_fd));

        let child = cmd
            .spawn()
            .map_err(|e| Error::FatalStartup(format!("failed to spawn firewall helper: {e}")))?;
        drop(child_std);

        let (read_half, write_half) = parent_half.into_split();
        let mut read = BufReader::new(read_half);

        let mut line = String::new();
        read.read_line(&mut line).await.map_err(Error::Io)?;
        let line = line.trim_end();
        let Some(method) = line.strip_prefix("READY ") else {
            return Err(Error::FatalStartup(format!("expected READY, got {line:?}")));
        };

        Ok(Self {
            child,
            read,
            write: write_half,
            method: method.to_string(),
        })
    }

    fn check_alive(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(Some(status)) => Err(Error::FatalStartup(format!(
                "firewall helper exited: {status}"
            ))),
            Ok(None) => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Send `ROUTES`, `NSLIST`, `PORTS`, and `GO`, then wait for `STARTED`.
    pub async fn start(
        &mut self,
        routes: &[RouteSpec],
        nameservers: &[Nameserver],
        ports: &PortAssignments,
        udp: bool,
    ) -> Result<()> {
        self.check_alive()?;

        self.write.write_all(b"ROUTES\n").await.map_err(Error::Io)?;
        for r in routes {
            let line = format!(
                "{},{},{},{}\n",
                r.family,
                r.width,
                r.exclude as u8,
                r.ip
            );
            self.write.write_all(line.as_bytes()).await.map_err(Error::Io)?;
        }
        self.write.write_all(b"\n").await.map_err(Error::Io)?;

        self.write.write_all(b"NSLIST\n").await.map_err(Error::Io)?;
        for ns in nameservers {
            let line = format!("{},{}\n", ns.family, ns.ip);
            self.write.write_all(line.as_bytes()).await.map_err(Error::Io)?;
        }

        let ports_line = format!(
            "PORTS {},{},{},{}\n",
            ports.redirect_v6, ports.redirect_v4, ports.dns_v6, ports.dns_v4
        );
        self.write.write_all(ports_line.as_bytes()).await.map_err(Error::Io)?;

        let go_line = format!("GO {}\n", udp as u8);
        self.write.write_all(go_line.as_bytes()).await.map_err(Error::Io)?;
        self.write.flush().await.map_err(Error::Io)?;

        let mut line = String::new();
        self.read.read_line(&mut line).await.map_err(Error::Io)?;
        self.check_alive()?;
        if line.trim_end() != "STARTED" {
            return Err(Error::FatalStartup(format!(
                "expected STARTED, got {:?}",
                line.trim_end()
            )));
        }
        Ok(())
    }

    /// Tell the helper to add a hostname->IP mapping (`HOST name,ip`), used
    /// while seeding `/etc/hosts`-style entries for the remote host list.
    pub async fn set_host_ip(&mut self, hostname: &str, ip: IpAddr) -> Result<()> {
        let line = format!("HOST {hostname},{ip}\n");
        self.write.write_all(line.as_bytes()).await.map_err(Error::Io)?;
        self.write.flush().await.map_err(Error::Io)
    }

    /// True if the helper process has exited.
    pub fn is_alive(&mut self) -> bool {
        self.check_alive().is_ok()
    }
}
