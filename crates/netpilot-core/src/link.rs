//! Link property snapshots reported by trackers and the set arithmetic the
//! reconciler runs over them.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::proxy::ProxyInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl LinkAddress {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// A single routing entry. A missing or unspecified gateway means the
/// destination is directly reachable on the interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteInfo {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: Option<String>,
}

impl RouteInfo {
    pub fn new(destination: IpNet, gateway: Option<IpAddr>, interface: Option<&str>) -> Self {
        Self {
            destination: destination.trunc(),
            gateway: gateway.filter(|gw| !gw.is_unspecified()),
            interface: interface.map(str::to_string),
        }
    }

    /// Default route (`0.0.0.0/0` or `::/0`) through `gateway`.
    pub fn default_via(gateway: IpAddr, interface: Option<&str>) -> Self {
        let destination = match gateway {
            IpAddr::V4(_) => IpNet::V4(Default::default()),
            IpAddr::V6(_) => IpNet::V6(Default::default()),
        };
        Self::new(destination, Some(gateway), interface)
    }

    /// Host route (`/32` or `/128`) to `host`, optionally through `gateway`.
    pub fn make_host_route(host: IpAddr, gateway: Option<IpAddr>, interface: Option<&str>) -> Self {
        let destination = IpNet::from(host);
        Self::new(destination, gateway, interface)
    }

    pub fn is_default_route(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    pub fn is_host_route(&self) -> bool {
        self.destination.prefix_len() == self.destination.max_prefix_len()
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.destination, IpNet::V4(_))
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        self.destination.contains(&addr)
    }

    /// Longest-prefix match of `dest` among same-family routes.
    pub fn select_best_route(routes: &[RouteInfo], dest: IpAddr) -> Option<&RouteInfo> {
        routes
            .iter()
            .filter(|route| route.matches(dest))
            .max_by_key(|route| route.destination.prefix_len())
    }
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(iface) = &self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Result of diffing two collections: what only the new one has and what
/// only the old one had. Duplicates are matched one for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareResult<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> Default for CompareResult<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T: PartialEq + Clone> CompareResult<T> {
    pub fn of(old: &[T], new: &[T]) -> Self {
        let mut removed = old.to_vec();
        let mut added = Vec::new();
        for item in new {
            match removed.iter().position(|r| r == item) {
                Some(idx) => {
                    removed.remove(idx);
                }
                None => added.push(item.clone()),
            }
        }
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProperties {
    pub interface_name: Option<String>,
    #[serde(default)]
    pub addresses: Vec<LinkAddress>,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub domains: Option<String>,
    #[serde(default)]
    pub http_proxy: Option<ProxyInfo>,
}

impl LinkProperties {
    pub fn new(interface_name: &str) -> Self {
        Self {
            interface_name: Some(interface_name.to_string()),
            ..Self::default()
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface_name.as_deref().filter(|name| !name.is_empty())
    }

    pub fn add_address(&mut self, address: LinkAddress) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// Routes inherit the link's interface unless they name their own.
    pub fn add_route(&mut self, mut route: RouteInfo) {
        if route.interface.is_none() {
            route.interface = self.interface_name.clone();
        }
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    pub fn add_dns(&mut self, server: IpAddr) {
        if !self.dns_servers.contains(&server) {
            self.dns_servers.push(server);
        }
    }

    pub fn default_routes(&self) -> impl Iterator<Item = &RouteInfo> {
        self.routes.iter().filter(|route| route.is_default_route())
    }

    pub fn is_identical_interface_name(&self, other: &LinkProperties) -> bool {
        self.interface() == other.interface()
    }

    pub fn compare_addresses(
        old: Option<&LinkProperties>,
        new: Option<&LinkProperties>,
    ) -> CompareResult<LinkAddress> {
        CompareResult::of(
            old.map(|lp| lp.addresses.as_slice()).unwrap_or_default(),
            new.map(|lp| lp.addresses.as_slice()).unwrap_or_default(),
        )
    }

    pub fn compare_routes(
        old: Option<&LinkProperties>,
        new: Option<&LinkProperties>,
    ) -> CompareResult<RouteInfo> {
        CompareResult::of(
            old.map(|lp| lp.routes.as_slice()).unwrap_or_default(),
            new.map(|lp| lp.routes.as_slice()).unwrap_or_default(),
        )
    }

    pub fn compare_dns(
        old: Option<&LinkProperties>,
        new: Option<&LinkProperties>,
    ) -> CompareResult<IpAddr> {
        CompareResult::of(
            old.map(|lp| lp.dns_servers.as_slice()).unwrap_or_default(),
            new.map(|lp| lp.dns_servers.as_slice()).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: &str, gw: Option<&str>) -> RouteInfo {
        RouteInfo::new(
            dest.parse().unwrap(),
            gw.map(|g| g.parse().unwrap()),
            Some("wlan0"),
        )
    }

    #[test]
    fn route_classification() {
        let default = route("0.0.0.0/0", Some("10.0.0.1"));
        assert!(default.is_default_route());
        assert!(!default.is_host_route());

        let host = RouteInfo::make_host_route("8.8.8.8".parse().unwrap(), None, Some("wlan0"));
        assert!(host.is_host_route());
        assert!(!host.has_gateway());

        let v6_default = RouteInfo::default_via("fe80::1".parse().unwrap(), None);
        assert!(v6_default.is_default_route());
        assert!(!v6_default.is_ipv4());
    }

    #[test]
    fn unspecified_gateway_is_dropped() {
        let r = route("10.0.0.0/24", Some("0.0.0.0"));
        assert_eq!(r.gateway, None);
    }

    #[test]
    fn destination_is_truncated_to_prefix() {
        let r = route("10.0.0.77/24", None);
        assert_eq!(r.destination.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn best_route_prefers_longest_prefix_of_same_family() {
        let routes = vec![
            route("0.0.0.0/0", Some("10.0.0.1")),
            route("10.0.0.0/24", None),
            route("::/0", Some("fe80::1")),
        ];
        let best = RouteInfo::select_best_route(&routes, "10.0.0.9".parse().unwrap()).unwrap();
        assert_eq!(best.destination.prefix_len(), 24);

        let best = RouteInfo::select_best_route(&routes, "1.1.1.1".parse().unwrap()).unwrap();
        assert!(best.is_default_route());
        assert!(best.is_ipv4());

        let only_v4 = &routes[..2];
        assert!(RouteInfo::select_best_route(only_v4, "2001:db8::1".parse().unwrap()).is_none());
    }

    #[test]
    fn compare_matches_duplicates_one_for_one() {
        let old = vec![1, 2, 2, 3];
        let new = vec![2, 3, 4];
        let diff = CompareResult::of(&old, &new);
        assert_eq!(diff.added, vec![4]);
        assert_eq!(diff.removed, vec![1, 2]);
    }

    #[test]
    fn compare_against_absent_snapshot() {
        let mut lp = LinkProperties::new("rmnet0");
        lp.add_route(route("0.0.0.0/0", Some("10.1.1.1")));
        lp.add_dns("10.1.1.53".parse().unwrap());

        let diff = LinkProperties::compare_routes(None, Some(&lp));
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());

        let diff = LinkProperties::compare_dns(Some(&lp), None);
        assert_eq!(diff.removed, lp.dns_servers);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn added_route_inherits_link_interface() {
        let mut lp = LinkProperties::new("eth0");
        lp.add_route(RouteInfo::new("192.168.0.0/16".parse().unwrap(), None, None));
        assert_eq!(lp.routes[0].interface.as_deref(), Some("eth0"));
    }
}
