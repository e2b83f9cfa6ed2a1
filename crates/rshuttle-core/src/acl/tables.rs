//! ACL tables and the matching logic used on every accepted connection.
//!
//! Four independent tables, closed by default:
//!
//! - `allowed_targets` / `disallowed_targets`: keyed by destination CIDR,
//!   valued by the set of ports (or port ranges) permitted on that CIDR.
//! - `allowed_sources` / `excluded_sources`: keyed by source IP, valued by
//!   a Unix-epoch millisecond expiry. A source is only "allowed" while its
//!   entry's expiry is still in the future.
//!
//! Matching precedence for a destination CIDR lookup (`matches_acl` in the
//! reference implementation): exact host (`/32` or `/128`) first, then the
//! default route (`0.0.0.0/0` / `::/0`), then a scan of the remaining
//! entries for the most specific containing subnet. When more than one
//! non-default subnet contains the destination, the reference picks
//! whichever its hash map iterates to first — an unspecified tie-break we
//! preserve rather than invent a total order for (see `DESIGN.md`).

use std::collections::HashMap;
use std::net::IpAddr;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Deserialize;

/// A single port or an inclusive range, as carried in the JSON ACL payload
/// (`"80"` or `"8000-9000"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Exact(u16),
    Range(u16, u16),
}

impl PortSpec {
    fn matches(&self, port: u16) -> bool {
        match *self {
            PortSpec::Exact(p) => p == port,
            PortSpec::Range(lo, hi) => port >= lo && port <= hi,
        }
    }
}

impl std::str::FromStr for PortSpec {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((lo, hi)) = s.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| crate::error::Error::ConfigInvalid(format!("bad port range '{s}'")))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| crate::error::Error::ConfigInvalid(format!("bad port range '{s}'")))?;
            Ok(PortSpec::Range(lo, hi))
        } else {
            let p: u16 = s
                .trim()
                .parse()
                .map_err(|_| crate::error::Error::ConfigInvalid(format!("bad port '{s}'")))?;
            Ok(PortSpec::Exact(p))
        }
    }
}

/// One destination-matching table: CIDR -> allowed ports on that CIDR.
pub type TargetTable = HashMap<IpNet, Vec<PortSpec>>;

/// One source-matching table: source IP -> expiry, epoch milliseconds.
pub type SourceTable = HashMap<IpAddr, i64>;

/// Raw JSON shape published on the ACL Redis keys: CIDR/IP strings mapping
/// to either a list of port strings (target tables) or a single expiry
/// (source tables). Deserialized once per reload, then converted into the
/// typed tables above.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct RawTargetAcl(HashMap<String, Vec<String>>);

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct RawSourceAcl(HashMap<String, i64>);

impl RawTargetAcl {
    pub fn into_table(self) -> TargetTable {
        let mut table = TargetTable::new();
        for (cidr_str, ports) in self.0 {
            let Ok(net) = cidr_str.parse::<IpNet>() else {
                tracing::warn!(cidr = %cidr_str, "failed to parse ACL CIDR entry, ignoring");
                continue;
            };
            let mut specs = Vec::with_capacity(ports.len());
            for p in ports {
                match p.parse::<PortSpec>() {
                    Ok(spec) => specs.push(spec),
                    Err(_) => tracing::warn!(port = %p, cidr = %cidr_str, "failed to parse ACL port entry, ignoring"),
                }
            }
            table.insert(net, specs);
        }
        table
    }
}

impl RawSourceAcl {
    pub fn into_table(self) -> SourceTable {
        let mut table = SourceTable::new();
        for (ip_str, expiry) in self.0 {
            match ip_str.parse::<IpAddr>() {
                Ok(ip) => {
                    table.insert(ip, expiry);
                }
                Err(_) => tracing::warn!(ip = %ip_str, "failed to parse ACL source IP, ignoring"),
            }
        }
        table
    }
}

/// A complete, immutable point-in-time view of all four ACL tables. Swapped
/// in as a unit so a reader never observes one table updated and another
/// stale mid-reload.
#[derive(Debug, Default, Clone)]
pub struct AclSnapshot {
    pub allowed_targets: TargetTable,
    pub disallowed_targets: TargetTable,
    pub allowed_sources: SourceTable,
    pub excluded_sources: SourceTable,
}

fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32).expect("/32 is always valid"),
        IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128).expect("/128 is always valid"),
    }
}

fn default_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(_) => "0.0.0.0/0".parse().unwrap(),
        IpAddr::V6(_) => "::/0".parse().unwrap(),
    }
}

/// Exact-host, then default-route, then most-specific-subnet-scan lookup
/// against one target table.
fn matches_acl(dst: IpAddr, port: u16, table: &TargetTable) -> bool {
    let host = host_net(dst);
    if let Some(ports) = table.get(&host) {
        if ports.iter().any(|p| p.matches(port)) {
            return true;
        }
    }

    let default = default_net(dst);
    if let Some(ports) = table.get(&default) {
        if ports.iter().any(|p| p.matches(port)) {
            return true;
        }
    }

    for (net, ports) in table {
        if *net == default || net.prefix_len() == host.prefix_len() {
            continue;
        }
        if net.contains(&dst) && ports.iter().any(|p| p.matches(port)) {
            return true;
        }
    }

    false
}

impl AclSnapshot {
    /// Whether a connection from `src` to `dst:port` is allowed, following
    /// the reference precedence: excluded sources bypass entirely, then the
    /// allowed-sources gate, then disallowed targets, then allowed targets.
    pub fn connection_is_allowed(&self, dst: IpAddr, port: u16, src: IpAddr, now_epoch_ms: i64) -> bool {
        if let Some(&expiry) = self.excluded_sources.get(&src) {
            if expiry >= now_epoch_ms {
                return true;
            }
        }

        let source_allowed = self
            .allowed_sources
            .get(&src)
            .is_some_and(|&expiry| expiry >= now_epoch_ms);
        if !source_allowed {
            return false;
        }

        if matches_acl(dst, port, &self.disallowed_targets) {
            return false;
        }
        matches_acl(dst, port, &self.allowed_targets)
    }
}

/// Lock-free, atomically-swapped holder for the current [`AclSnapshot`].
/// Readers call [`AclTables::snapshot`] to get a cheap `Arc` clone that
/// can't tear mid-reload; writers (the Redis subscriber) call one of the
/// `set_*` methods to replace a single table while leaving the others
/// untouched.
#[derive(Default)]
pub struct AclTables {
    inner: ArcSwap<AclSnapshot>,
}

impl AclTables {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(AclSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> arc_swap::Guard<std::sync::Arc<AclSnapshot>> {
        self.inner.load()
    }

    pub fn set_allowed_targets(&self, table: TargetTable) {
        self.inner.rcu(|cur| {
            let mut next = (**cur).clone();
            next.allowed_targets = table.clone();
            next
        });
    }

    pub fn set_disallowed_targets(&self, table: TargetTable) {
        self.inner.rcu(|cur| {
            let mut next = (**cur).clone();
            next.disallowed_targets = table.clone();
            next
        });
    }

    pub fn set_allowed_sources(&self, table: SourceTable) {
        self.inner.rcu(|cur| {
            let mut next = (**cur).clone();
            next.allowed_sources = table.clone();
            next
        });
    }

    pub fn set_excluded_sources(&self, table: SourceTable) {
        self.inner.rcu(|cur| {
            let mut next = (**cur).clone();
            next.excluded_sources = table.clone();
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_targets(allowed: TargetTable, disallowed: TargetTable) -> AclSnapshot {
        AclSnapshot {
            allowed_targets: allowed,
            disallowed_targets: disallowed,
            allowed_sources: SourceTable::new(),
            excluded_sources: SourceTable::new(),
        }
    }

    fn allow_all_sources(snap: &mut AclSnapshot, src: IpAddr) {
        snap.allowed_sources.insert(src, i64::MAX);
    }

    #[test]
    fn closed_by_default_when_tables_are_empty() {
        let mut snap = AclSnapshot::default();
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        allow_all_sources(&mut snap, src);
        let dst: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(!snap.connection_is_allowed(dst, 443, src, 0));
    }

    #[test]
    fn exact_host_allow_entry_matches() {
        let mut allowed = TargetTable::new();
        allowed.insert("93.184.216.34/32".parse().unwrap(), vec![PortSpec::Exact(443)]);
        let mut snap = snapshot_with_targets(allowed, TargetTable::new());
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        allow_all_sources(&mut snap, src);
        let dst: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(snap.connection_is_allowed(dst, 443, src, 0));
        assert!(!snap.connection_is_allowed(dst, 80, src, 0));
    }

    #[test]
    fn default_route_entry_matches_any_destination() {
        let mut allowed = TargetTable::new();
        allowed.insert("0.0.0.0/0".parse().unwrap(), vec![PortSpec::Range(1, 1024)]);
        let mut snap = snapshot_with_targets(allowed, TargetTable::new());
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        allow_all_sources(&mut snap, src);
        let dst: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(snap.connection_is_allowed(dst, 22, src, 0));
        assert!(!snap.connection_is_allowed(dst, 8080, src, 0));
    }

    #[test]
    fn subnet_entry_matches_containment() {
        let mut allowed = TargetTable::new();
        allowed.insert("192.0.2.0/24".parse().unwrap(), vec![PortSpec::Exact(8080)]);
        let mut snap = snapshot_with_targets(allowed, TargetTable::new());
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        allow_all_sources(&mut snap, src);
        let dst: IpAddr = "192.0.2.55".parse().unwrap();
        assert!(snap.connection_is_allowed(dst, 8080, src, 0));
        let outside: IpAddr = "198.51.100.5".parse().unwrap();
        assert!(!snap.connection_is_allowed(outside, 8080, src, 0));
    }

    #[test]
    fn disallowed_takes_precedence_over_allowed() {
        let mut allowed = TargetTable::new();
        allowed.insert("0.0.0.0/0".parse().unwrap(), vec![PortSpec::Exact(443)]);
        let mut disallowed = TargetTable::new();
        disallowed.insert("203.0.113.0/24".parse().unwrap(), vec![PortSpec::Exact(443)]);
        let mut snap = snapshot_with_targets(allowed, disallowed);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        allow_all_sources(&mut snap, src);
        let dst: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(!snap.connection_is_allowed(dst, 443, src, 0));
    }

    #[test]
    fn excluded_source_bypasses_allowed_sources_gate() {
        let mut snap = AclSnapshot::default();
        let src: IpAddr = "10.0.0.9".parse().unwrap();
        snap.excluded_sources.insert(src, i64::MAX);
        snap.allowed_targets
            .insert("0.0.0.0/0".parse().unwrap(), vec![PortSpec::Exact(80)]);
        let dst: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(snap.connection_is_allowed(dst, 80, src, 0));
    }

    #[test]
    fn expired_source_entry_is_not_allowed() {
        let mut snap = AclSnapshot::default();
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        snap.allowed_sources.insert(src, 1_000);
        snap.allowed_targets
            .insert("0.0.0.0/0".parse().unwrap(), vec![PortSpec::Exact(80)]);
        let dst: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(!snap.connection_is_allowed(dst, 80, src, 2_000));
    }

    #[test]
    fn atomic_swap_via_arc_swap_is_visible_to_existing_guard_holders() {
        let tables = AclTables::new();
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let mut allowed = TargetTable::new();
        allowed.insert("0.0.0.0/0".parse().unwrap(), vec![PortSpec::Exact(80)]);
        tables.set_allowed_sources({
            let mut m = SourceTable::new();
            m.insert(src, i64::MAX);
            m
        });
        tables.set_allowed_targets(allowed);

        let dst: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(tables.snapshot().connection_is_allowed(dst, 80, src, 0));
    }
}
