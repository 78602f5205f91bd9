//! Routing table management via rtnetlink.
//!
//! Routes are added to the main table or to a numbered table, optionally
//! with a metric. Deletion looks the route up in a kernel dump first so the
//! exact message the kernel holds is the one removed.

use crate::error::{NetlinkError, Result};
use futures::stream::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::route::{RouteAttribute, RouteMessage, RouteScope};
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `RT_TABLE_MAIN`.
pub const MAIN_TABLE: u32 = 254;

/// A route as the reconciler asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: String,
    /// `None` is the main table.
    pub table: Option<u32>,
    pub metric: Option<u32>,
}

impl RouteSpec {
    fn table_id(&self) -> u32 {
        self.table.unwrap_or(MAIN_TABLE)
    }

    fn gateway_label(&self) -> String {
        self.gateway
            .map(|gw| gw.to_string())
            .unwrap_or_else(|| "link".to_string())
    }
}

/// Routing table entry read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// `None` for a default route.
    pub destination: Option<IpAddr>,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub interface_index: Option<u32>,
    pub metric: Option<u32>,
    pub table: u32,
}

impl RouteEntry {
    fn from_message(route: &RouteMessage) -> Self {
        let mut entry = RouteEntry {
            destination: None,
            prefix_len: route.header.destination_prefix_length,
            gateway: None,
            interface_index: None,
            metric: None,
            table: u32::from(route.header.table),
        };
        for nla in &route.attributes {
            match nla {
                RouteAttribute::Destination(dst) => entry.destination = route_address_to_ipaddr(dst),
                RouteAttribute::Gateway(gw) => entry.gateway = route_address_to_ipaddr(gw),
                RouteAttribute::Oif(idx) => entry.interface_index = Some(*idx),
                RouteAttribute::Priority(value) => entry.metric = Some(*value),
                RouteAttribute::Table(table) => entry.table = *table,
                _ => {}
            }
        }
        entry
    }

    pub fn is_default(&self) -> bool {
        is_default_route(self.prefix_len, self.destination)
    }

    /// Whether this kernel entry is the one `spec` describes on the interface
    /// with index `oif`. Gateway and metric only narrow the match when the
    /// spec names them.
    pub fn matches(&self, spec: &RouteSpec, oif: u32) -> bool {
        let destination_matches = if spec.destination.prefix_len() == 0 {
            self.is_default()
        } else {
            self.prefix_len == spec.destination.prefix_len()
                && self.destination == Some(spec.destination.network())
        };
        destination_matches
            && self.interface_index == Some(oif)
            && self.table == spec.table_id()
            && spec.gateway.map_or(true, |gw| self.gateway == Some(gw))
            && spec.metric.map_or(true, |m| self.metric == Some(m))
    }
}

/// Manager for routing table operations.
///
/// Each manager owns its own netlink connection, spawned as a background
/// tokio task, so it must be created inside a runtime.
pub struct RouteManager {
    handle: Handle,
}

impl RouteManager {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = new_connection().map_err(|e| {
            NetlinkError::runtime(
                "creating netlink connection for route management",
                e.to_string(),
            )
        })?;

        tokio::spawn(connection);

        Ok(Self { handle })
    }

    /// Adds `spec`. Fails with `AddRouteError` when the kernel already has it.
    pub async fn add_route(&self, spec: &RouteSpec) -> Result<()> {
        self.install(spec, false).await
    }

    /// Adds `spec`, replacing a route with the same destination and table.
    pub async fn replace_route(&self, spec: &RouteSpec) -> Result<()> {
        self.install(spec, true).await
    }

    /// Deletes the kernel route matching `spec`. A route that is already gone
    /// is not an error.
    pub async fn delete_route(&self, spec: &RouteSpec) -> Result<()> {
        let index = self.get_interface_index(&spec.interface).await?;
        let mut routes = self
            .handle
            .route()
            .get(ip_version(&spec.destination.addr()))
            .execute();

        while let Some(route) =
            routes
                .try_next()
                .await
                .map_err(|e| NetlinkError::ListRoutesError {
                    reason: e.to_string(),
                })?
        {
            if !RouteEntry::from_message(&route).matches(spec, index) {
                continue;
            }

            let mut del = self.handle.route().del(route.clone());
            del.message_mut().header = route.header;
            del.execute()
                .await
                .map_err(|e| NetlinkError::DeleteRouteError {
                    destination: spec.destination.to_string(),
                    interface: spec.interface.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(
                target: "route",
                "Deleted route {} via {} on {} (table={})",
                spec.destination,
                spec.gateway_label(),
                spec.interface,
                spec.table_id()
            );
            return Ok(());
        }

        tracing::debug!(
            target: "route",
            "Route {} on {} not present, nothing to delete",
            spec.destination,
            spec.interface
        );
        Ok(())
    }

    /// Makes `gateway` on `interface` the interface's only default route in
    /// the main table for that address family.
    ///
    /// Other default routes on the same interface are removed; defaults on
    /// other interfaces are left alone so two networks can hold defaults with
    /// different metrics.
    pub async fn replace_default_route(
        &self,
        gateway: IpAddr,
        interface: &str,
        metric: Option<u32>,
    ) -> Result<()> {
        let index = self.get_interface_index(interface).await?;
        let has_match = self
            .delete_conflicting_default_routes(gateway, index, metric)
            .await?;
        if has_match {
            tracing::debug!(
                target: "route",
                "Default route via {} on {} already present (metric={:?})",
                gateway,
                interface,
                metric
            );
            return Ok(());
        }
        let unspecified = match gateway {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let destination =
            IpNet::new(unspecified, 0).map_err(|e| NetlinkError::InvalidArgument {
                parameter: "default route".to_string(),
                value: unspecified.to_string(),
                reason: e.to_string(),
            })?;
        self.add_route(&RouteSpec {
            destination,
            gateway: Some(gateway),
            interface: interface.to_string(),
            table: None,
            metric,
        })
        .await
    }

    /// Lists IPv4 and IPv6 routes from every table.
    pub async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        let mut route_list = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = self.handle.route().get(version).execute();
            while let Some(route) =
                routes
                    .try_next()
                    .await
                    .map_err(|e| NetlinkError::ListRoutesError {
                        reason: e.to_string(),
                    })?
            {
                let entry = RouteEntry::from_message(&route);
                if entry.destination.is_some() || entry.gateway.is_some() {
                    route_list.push(entry);
                }
            }
        }
        Ok(route_list)
    }

    async fn install(&self, spec: &RouteSpec, replace: bool) -> Result<()> {
        let index = self.get_interface_index(&spec.interface).await?;
        let add_error = |reason: String| NetlinkError::AddRouteError {
            destination: spec.destination.to_string(),
            gateway: spec.gateway_label(),
            interface: spec.interface.clone(),
            reason,
        };

        match spec.destination {
            IpNet::V4(dst) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(dst.network(), dst.prefix_len())
                    .output_interface(index);
                match spec.gateway {
                    Some(IpAddr::V4(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V6(_)) => {
                        return Err(add_error("IPv6 gateway for an IPv4 route".to_string()))
                    }
                    None => {}
                }
                if replace {
                    req = req.replace();
                }
                decorate(req.message_mut(), spec);
                req.execute().await.map_err(|e| add_error(e.to_string()))?;
            }
            IpNet::V6(dst) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(dst.network(), dst.prefix_len())
                    .output_interface(index);
                match spec.gateway {
                    Some(IpAddr::V6(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V4(_)) => {
                        return Err(add_error("IPv4 gateway for an IPv6 route".to_string()))
                    }
                    None => {}
                }
                if replace {
                    req = req.replace();
                }
                decorate(req.message_mut(), spec);
                req.execute().await.map_err(|e| add_error(e.to_string()))?;
            }
        }

        tracing::debug!(
            target: "route",
            "{} route {} via {} on {} (table={}, metric={:?})",
            if replace { "Replaced" } else { "Added" },
            spec.destination,
            spec.gateway_label(),
            spec.interface,
            spec.table_id(),
            spec.metric
        );
        Ok(())
    }

    async fn get_interface_index(&self, name: &str) -> Result<u32> {
        if name.is_empty() {
            return Err(NetlinkError::empty_interface());
        }

        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        if let Some(link) =
            links
                .try_next()
                .await
                .map_err(|e| NetlinkError::InterfaceIndexError {
                    interface: name.to_string(),
                    reason: e.to_string(),
                })?
        {
            Ok(link.header.index)
        } else {
            Err(NetlinkError::InterfaceNotFound {
                name: name.to_string(),
            })
        }
    }

    async fn delete_conflicting_default_routes(
        &self,
        gateway: IpAddr,
        interface_index: u32,
        metric: Option<u32>,
    ) -> Result<bool> {
        let mut routes = self.handle.route().get(ip_version(&gateway)).execute();
        let mut found_match = false;

        while let Some(route) =
            routes
                .try_next()
                .await
                .map_err(|e| NetlinkError::ListRoutesError {
                    reason: e.to_string(),
                })?
        {
            let entry = RouteEntry::from_message(&route);
            if !entry.is_default()
                || entry.table != MAIN_TABLE
                || entry.interface_index != Some(interface_index)
            {
                continue;
            }

            let matches_gateway = entry.gateway == Some(gateway);
            let matches_metric = metric.map_or(true, |want| entry.metric == Some(want));
            if matches_gateway && matches_metric && !found_match {
                found_match = true;
                continue;
            }

            let mut del = self.handle.route().del(route.clone());
            del.message_mut().header = route.header;

            del.execute()
                .await
                .map_err(|e| NetlinkError::DeleteRouteError {
                    destination: "default".to_string(),
                    interface: format!("{:?}", entry.interface_index),
                    reason: e.to_string(),
                })?;

            tracing::debug!(
                target: "route",
                "Deleted conflicting default route via {:?} on interface {:?}",
                entry.gateway,
                entry.interface_index
            );
        }

        Ok(found_match)
    }
}

/// Table, metric and scope attributes the request builders do not cover.
fn decorate(message: &mut RouteMessage, spec: &RouteSpec) {
    if let Some(table) = spec.table {
        // RT_TABLE_UNSPEC in the header; the attribute carries the full id.
        message.header.table = u8::try_from(table).unwrap_or(0);
        message.attributes.push(RouteAttribute::Table(table));
    }
    if let Some(metric) = spec.metric {
        message.attributes.push(RouteAttribute::Priority(metric));
    }
    if spec.gateway.is_none() && spec.destination.prefix_len() != 0 {
        message.header.scope = RouteScope::Link;
    }
}

fn ip_version(addr: &IpAddr) -> IpVersion {
    match addr {
        IpAddr::V4(_) => IpVersion::V4,
        IpAddr::V6(_) => IpVersion::V6,
    }
}

fn route_address_to_ipaddr(addr: &netlink_packet_route::route::RouteAddress) -> Option<IpAddr> {
    use netlink_packet_route::route::RouteAddress;
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn is_default_route(prefix_len: u8, destination: Option<IpAddr>) -> bool {
    if prefix_len != 0 {
        return false;
    }
    destination.map(|ip| ip.is_unspecified()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(destination: Option<[u8; 4]>, prefix_len: u8) -> RouteEntry {
        RouteEntry {
            destination: destination.map(|d| IpAddr::V4(Ipv4Addr::from(d))),
            prefix_len,
            gateway: None,
            interface_index: Some(3),
            metric: None,
            table: MAIN_TABLE,
        }
    }

    fn spec(destination: &str) -> RouteSpec {
        RouteSpec {
            destination: destination.parse().unwrap(),
            gateway: None,
            interface: "wlan0".to_string(),
            table: None,
            metric: None,
        }
    }

    #[test]
    fn default_route_detection() {
        assert!(is_default_route(0, None));
        assert!(is_default_route(0, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))));
        assert!(!is_default_route(24, None));
        assert!(!is_default_route(0, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)))));
    }

    #[test]
    fn subnet_spec_matches_by_network_address() {
        let kernel = entry(Some([192, 168, 1, 0]), 24);
        assert!(kernel.matches(&spec("192.168.1.20/24"), 3));
        assert!(!kernel.matches(&spec("192.168.1.20/24"), 4));
        assert!(!kernel.matches(&spec("192.168.2.0/24"), 3));
    }

    #[test]
    fn table_and_metric_narrow_the_match() {
        let mut kernel = entry(None, 0);
        kernel.gateway = Some(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1)));
        kernel.metric = Some(10);

        let mut wanted = spec("0.0.0.0/0");
        assert!(kernel.matches(&wanted, 3));
        wanted.metric = Some(0);
        assert!(!kernel.matches(&wanted, 3));
        wanted.metric = Some(10);
        wanted.table = Some(101);
        assert!(!kernel.matches(&wanted, 3));
        kernel.table = 101;
        assert!(kernel.matches(&wanted, 3));
    }
}
