//! Typed startup configuration, assembled once from CLI flags and
//! environment variables and never re-read for the life of the process.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Lowest port tried during the redirector/DNS port search, counting down
/// from [`PORT_SEARCH_START`].
pub const PORT_SEARCH_END: u16 = 9001;
/// Highest (first-tried) port in the redirector/DNS port search range.
pub const PORT_SEARCH_START: u16 = 12300;

/// Environment variable names read at startup (unchanged from `spec.md` §6).
pub mod env_vars {
    pub const DNS_PROXY_SUFFIX: &str = "DNS_PROXY_SUFFIX";
    pub const DNS_1: &str = "DNS_1";
    pub const DNS_2: &str = "DNS_2";
    pub const REDIS_HOST: &str = "REDIS_HOST";
    pub const REDIS_PORT: &str = "REDIS_PORT";
}

/// One included or excluded subnet, as accepted on the CLI and forwarded
/// to the firewall helper's `ROUTES` line.
#[derive(Debug, Clone)]
pub struct Subnet {
    pub family: i32,
    pub ip: IpAddr,
    pub width: u8,
    pub exclude: bool,
}

impl Subnet {
    /// Mark this subnet as an exclusion, for building `--exclude` entries
    /// out of the same `ip/width` parser used for `--include`.
    pub fn excluded(mut self) -> Self {
        self.exclude = true;
        self
    }
}

/// Parses `ip/width` (e.g. `10.0.0.0/8`, `fd00::/64`) into an included
/// subnet. Use [`Subnet::excluded`] to turn it into an exclusion.
impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let net: IpNet = s
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("bad subnet '{s}': {e}")))?;
        let family = if net.addr().is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
        Ok(Self {
            family,
            ip: net.addr(),
            width: net.prefix_len(),
            exclude: false,
        })
    }
}

/// Redis coordinates for the live ACL subscriber.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(env_vars::REDIS_HOST).ok()?;
        let port = std::env::var(env_vars::REDIS_PORT)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379);
        Some(Self { host, port })
    }
}

/// DNS suffix-bypass configuration: which suffixes route straight to the
/// two upstream servers instead of through the relay.
#[derive(Debug, Clone, Default)]
pub struct DnsBypassConfig {
    pub suffix: Option<String>,
    pub server_1: Option<IpAddr>,
    pub server_2: Option<IpAddr>,
}

impl DnsBypassConfig {
    pub fn from_env() -> Self {
        Self {
            suffix: std::env::var(env_vars::DNS_PROXY_SUFFIX).ok(),
            server_1: std::env::var(env_vars::DNS_1).ok().and_then(|s| s.parse().ok()),
            server_2: std::env::var(env_vars::DNS_2).ok().and_then(|s| s.parse().ok()),
        }
    }

    /// Builds the runtime [`crate::listeners::dns::DnsBypass`] state, or
    /// `None` if the suffix or either upstream server is unset — direct
    /// bypass needs a suffix and two servers to swap between on failure.
    pub fn into_bypass(self) -> Option<crate::listeners::dns::DnsBypass> {
        let suffix = self.suffix?;
        let server_1 = self.server_1?;
        let server_2 = self.server_2?;
        Some(crate::listeners::dns::DnsBypass {
            suffixes: vec![suffix],
            preferred: Some(SocketAddr::new(server_1, 53)),
            fallback: Some(SocketAddr::new(server_2, 53)),
        })
    }
}

/// Full startup configuration for one redirector session.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_v6: Option<SocketAddr>,
    pub listen_v4: Option<SocketAddr>,
    pub relay_command: Vec<String>,
    pub firewall_argv: Vec<String>,
    pub subnets_include: Vec<Subnet>,
    pub subnets_exclude: Vec<Subnet>,
    pub nameservers: Vec<IpAddr>,
    pub dns_bypass: DnsBypassConfig,
    pub udp_enabled: bool,
    pub latency_control: bool,
    pub seed_hosts: Vec<String>,
    pub redis: Option<RedisConfig>,
    pub daemon: bool,
    pub pidfile: Option<std::path::PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen_v6.is_none() && self.listen_v4.is_none() {
            return Err(Error::ConfigInvalid(
                "at least one of --listen-v6/--listen-v4 must be set".into(),
            ));
        }
        if self.relay_command.is_empty() {
            return Err(Error::ConfigInvalid("relay command must not be empty".into()));
        }
        if self.firewall_argv.is_empty() {
            return Err(Error::ConfigInvalid("firewall helper argv must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_parses_v4_cidr() {
        let s: Subnet = "10.0.0.0/8".parse().unwrap();
        assert_eq!(s.family, libc::AF_INET);
        assert_eq!(s.width, 8);
        assert!(!s.exclude);
    }

    #[test]
    fn subnet_parses_v6_cidr() {
        let s: Subnet = "fd00::/64".parse().unwrap();
        assert_eq!(s.family, libc::AF_INET6);
        assert_eq!(s.width, 64);
    }

    #[test]
    fn subnet_excluded_sets_flag() {
        let s: Subnet = "10.0.0.0/8".parse::<Subnet>().unwrap().excluded();
        assert!(s.exclude);
    }

    #[test]
    fn subnet_rejects_bare_ip_without_prefix() {
        assert!("10.0.0.0".parse::<Subnet>().is_err());
    }

    #[test]
    fn dns_bypass_needs_suffix_and_both_servers() {
        let cfg = DnsBypassConfig {
            suffix: Some("corp.local".into()),
            server_1: Some("10.1.1.1".parse().unwrap()),
            server_2: None,
        };
        assert!(cfg.into_bypass().is_none());

        let cfg = DnsBypassConfig {
            suffix: Some("corp.local".into()),
            server_1: Some("10.1.1.1".parse().unwrap()),
            server_2: Some("10.1.1.2".parse().unwrap()),
        };
        let bypass = cfg.into_bypass().unwrap();
        assert_eq!(bypass.suffixes, vec!["corp.local".to_string()]);
        assert_eq!(bypass.preferred, Some("10.1.1.1:53".parse().unwrap()));
    }

    #[test]
    fn validate_requires_a_listener() {
        let cfg = Config {
            listen_v6: None,
            listen_v4: None,
            relay_command: vec!["ssh".into()],
            firewall_argv: vec!["rshuttle-firewall".into()],
            subnets_include: Vec::new(),
            subnets_exclude: Vec::new(),
            nameservers: Vec::new(),
            dns_bypass: DnsBypassConfig::default(),
            udp_enabled: false,
            latency_control: true,
            seed_hosts: Vec::new(),
            redis: None,
            daemon: false,
            pidfile: None,
        };
        assert!(cfg.validate().is_err());
    }
}
