//! Route reconciliation against the kernel tables.
//!
//! The reconciler diffs the stored and newly reported link properties of one
//! network and issues the smallest set of kernel operations that moves the
//! tables from one to the other. Routes in the main table are reference
//! counted through [`AddedRoutes`] so a route shared by two networks stays
//! installed until its last user goes away.

mod added;
mod diff;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

pub use added::{AddedRoutes, Release};
pub use diff::{reset_mask, LinkDiff};

use crate::error::{CoreError, Result};
use crate::link::{LinkProperties, RouteInfo};
use crate::netd::Netd;
use crate::registry::RouteAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Main,
    Secondary(u32),
}

pub struct Reconciler {
    netd: Arc<dyn Netd>,
    added: AddedRoutes,
    recursion_cap: u32,
}

impl Reconciler {
    pub fn new(netd: Arc<dyn Netd>, recursion_cap: u32) -> Self {
        Self {
            netd,
            added: AddedRoutes::new(),
            recursion_cap,
        }
    }

    pub fn added_routes(&self) -> &AddedRoutes {
        &self.added
    }

    /// Moves the kernel from `cur` to `new` for one network and returns
    /// whether any route changed.
    ///
    /// Default links own the main table. Non-default links only place their
    /// non-default routes there; their default routes go to the per-type
    /// secondary table. `metric`, when set, is attached to main-table
    /// additions of non-host routes.
    pub fn update_routes(
        &mut self,
        new: Option<&LinkProperties>,
        cur: Option<&LinkProperties>,
        is_link_default: bool,
        attrs: RouteAttributes,
        metric: Option<u32>,
    ) -> bool {
        let diff = LinkDiff::between(cur, new);
        let routes_changed = diff.routes_changed();

        if let Some(cur) = cur {
            for route in &diff.routes.removed {
                if is_link_default || !route.is_default_route() {
                    self.modify_logged(cur, route, Op::Remove, Table::Main, None);
                }
                if !is_link_default {
                    self.modify_logged(cur, route, Op::Remove, Table::Secondary(attrs.table_id), None);
                }
            }
        }

        if let Some(new) = new {
            for route in &diff.routes.added {
                if is_link_default || !route.is_default_route() {
                    self.modify_logged(new, route, Op::Add, Table::Main, metric);
                } else {
                    self.modify_logged(new, route, Op::Add, Table::Secondary(attrs.table_id), None);
                    // Radio drivers sometimes install their own default route.
                    if let Some(iface) = new.interface() {
                        if !self.added.contains(route) {
                            self.kernel(
                                "remove driver default route",
                                route,
                                self.netd.remove_route(iface, route),
                            );
                        }
                    }
                }
            }
        }

        self.update_source_routes(new, &diff, attrs, routes_changed);

        if !is_link_default {
            self.update_dns_routes(new, cur, &diff, routes_changed);
        }

        routes_changed
    }

    fn update_source_routes(
        &mut self,
        new: Option<&LinkProperties>,
        diff: &LinkDiff,
        attrs: RouteAttributes,
        routes_changed: bool,
    ) {
        for addr in &diff.addresses.removed {
            self.kernel(
                "delete source route",
                addr,
                self.netd.del_src_route(addr.address, attrs.table_id),
            );
        }

        let Some(new) = new else { return };
        let Some(iface) = new.interface() else { return };
        for addr in &new.addresses {
            if !routes_changed && !diff.addresses.added.contains(addr) {
                continue;
            }
            let gateway = new
                .default_routes()
                .find(|route| route.is_ipv4() == addr.is_ipv4())
                .and_then(|route| route.gateway);
            self.kernel(
                "replace source route",
                addr,
                self.netd
                    .replace_src_route(iface, addr.address, gateway, attrs.table_id),
            );
        }
    }

    /// Host routes to a non-default link's DNS servers keep name lookups
    /// reachable through that link.
    fn update_dns_routes(
        &mut self,
        new: Option<&LinkProperties>,
        cur: Option<&LinkProperties>,
        diff: &LinkDiff,
        routes_changed: bool,
    ) {
        if routes_changed {
            if let Some(cur) = cur {
                for server in &cur.dns_servers {
                    self.remove_route_to_address(cur, *server);
                }
            }
            if let Some(new) = new {
                for server in &new.dns_servers {
                    self.add_route_to_address(new, *server);
                }
            }
        } else {
            if let Some(cur) = cur {
                for server in &diff.dns.removed {
                    self.remove_route_to_address(cur, *server);
                }
            }
            if let Some(new) = new {
                for server in &diff.dns.added {
                    self.add_route_to_address(new, *server);
                }
            }
        }
    }

    /// Installs a host route to `addr` through the link's best matching route.
    /// Returns the route on success so callers can release it later.
    pub fn add_route_to_address(&mut self, lp: &LinkProperties, addr: IpAddr) -> Option<RouteInfo> {
        let route = host_route_for(lp, addr);
        match self.modify_route(lp, &route, 0, Op::Add, Table::Main, None) {
            Ok(true) => Some(route),
            Ok(false) => None,
            Err(err) => {
                warn!("{}", err);
                None
            }
        }
    }

    pub fn remove_route_to_address(&mut self, lp: &LinkProperties, addr: IpAddr) {
        let route = host_route_for(lp, addr);
        self.modify_logged(lp, &route, Op::Remove, Table::Main, None);
    }

    /// Releases a route previously returned by [`Self::add_route_to_address`].
    pub fn remove_host_route(&mut self, lp: &LinkProperties, route: &RouteInfo) {
        self.modify_logged(lp, route, Op::Remove, Table::Main, None);
    }

    /// Takes the link's default routes out of the main table.
    pub fn remove_default_routes(&mut self, lp: &LinkProperties) {
        let routes: Vec<RouteInfo> = lp.default_routes().cloned().collect();
        for route in &routes {
            self.modify_logged(lp, route, Op::Remove, Table::Main, None);
        }
    }

    /// Puts the link's default routes back into the main table.
    pub fn restore_default_routes(&mut self, lp: &LinkProperties, metric: Option<u32>) {
        let routes: Vec<RouteInfo> = lp.default_routes().cloned().collect();
        for route in &routes {
            self.modify_logged(lp, route, Op::Add, Table::Main, metric);
        }
    }

    /// Re-installs the link's default routes in place with `metric`.
    pub fn republish_default_routes(&mut self, lp: &LinkProperties, metric: u32) {
        let Some(iface) = lp.interface() else {
            warn!("Cannot republish default routes without an interface");
            return;
        };
        for route in lp.default_routes() {
            let Some(gateway) = route.gateway else {
                continue;
            };
            if self
                .kernel(
                    "replace default route",
                    route,
                    self.netd.replace_default_route(iface, gateway, metric),
                )
                && !self.added.contains(route)
            {
                self.added.add(route.clone());
            }
        }
    }

    fn modify_logged(
        &mut self,
        lp: &LinkProperties,
        route: &RouteInfo,
        op: Op,
        table: Table,
        metric: Option<u32>,
    ) {
        if let Err(err) = self.modify_route(lp, route, 0, op, table, metric) {
            warn!(target: "route", "{}", err);
        }
    }

    /// Applies one route operation. For a gatewayed non-host route the
    /// implied host route to the gateway is handled first, recursively.
    fn modify_route(
        &mut self,
        lp: &LinkProperties,
        route: &RouteInfo,
        depth: u32,
        op: Op,
        table: Table,
        metric: Option<u32>,
    ) -> Result<bool> {
        let iface = route
            .interface
            .as_deref()
            .or_else(|| lp.interface())
            .ok_or_else(|| CoreError::MissingInterface(route.to_string()))?;
        if depth > self.recursion_cap {
            return Err(CoreError::RouteRecursion {
                route: route.to_string(),
                cap: self.recursion_cap,
            });
        }

        if !route.is_host_route() {
            if let Some(gateway) = route.gateway {
                if let Some(best) = RouteInfo::select_best_route(&lp.routes, gateway) {
                    let via = if best.gateway == Some(gateway) {
                        None
                    } else {
                        best.gateway
                    };
                    let implied = RouteInfo::make_host_route(gateway, via, Some(iface));
                    if let Err(err) = self.modify_route(lp, &implied, depth + 1, op, table, None) {
                        warn!(target: "route", "Skipping route to gateway {}: {}", gateway, err);
                    }
                }
            }
        }

        let done = match (op, table) {
            (Op::Add, Table::Main) => {
                let refs = self.added.add(route.clone());
                if refs > 1 {
                    debug!(target: "route", "{} already installed ({} users)", route, refs);
                    return Ok(true);
                }
                let result = match metric {
                    Some(metric) if !route.is_host_route() => {
                        self.netd.add_route_with_metric(iface, metric, route)
                    }
                    _ => self.netd.add_route(iface, route),
                };
                let ok = self.kernel("add route", route, result);
                if !ok {
                    self.added.remove(route);
                }
                ok
            }
            (Op::Remove, Table::Main) => match self.added.remove(route) {
                Release::Released => {
                    self.kernel("remove route", route, self.netd.remove_route(iface, route))
                }
                Release::StillReferenced(refs) => {
                    debug!(target: "route", "Keeping {}: still used by {} other link(s)", route, refs);
                    true
                }
                Release::NotPresent => {
                    debug!(target: "route", "{} was never installed", route);
                    false
                }
            },
            (Op::Add, Table::Secondary(table_id)) => self.kernel(
                "add secondary route",
                route,
                self.netd.add_secondary_route(iface, route, table_id),
            ),
            (Op::Remove, Table::Secondary(table_id)) => self.kernel(
                "remove secondary route",
                route,
                self.netd.remove_secondary_route(iface, route, table_id),
            ),
        };
        Ok(done)
    }

    fn kernel(&self, what: &str, subject: &dyn fmt::Display, result: anyhow::Result<()>) -> bool {
        match result {
            Ok(()) => {
                debug!(target: "route", "{} {}", what, subject);
                true
            }
            Err(err) => {
                warn!(target: "route", "Failed to {} {}: {:#}", what, subject, err);
                false
            }
        }
    }
}

/// Host route to `addr` through the link's best matching route, or direct
/// when nothing matches or the best route is itself a route to `addr`.
fn host_route_for(lp: &LinkProperties, addr: IpAddr) -> RouteInfo {
    let via = RouteInfo::select_best_route(&lp.routes, addr)
        .and_then(|best| best.gateway)
        .filter(|gateway| *gateway != addr);
    RouteInfo::make_host_route(addr, via, lp.interface())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkAddress;
    use crate::netd::tests::{MockNetd, NetdCall};
    use crate::types::NetworkType;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn wifi_link() -> LinkProperties {
        let mut lp = LinkProperties::new("wlan0");
        lp.add_address(LinkAddress::new(ip("192.168.1.20"), 24));
        lp.add_route(RouteInfo::new("192.168.1.0/24".parse().unwrap(), None, None));
        lp.add_route(RouteInfo::default_via(ip("192.168.1.1"), None));
        lp.add_dns(ip("192.168.1.1"));
        lp
    }

    fn reconciler() -> (Reconciler, MockNetd) {
        let netd = MockNetd::new();
        (Reconciler::new(Arc::new(netd.clone()), 10), netd)
    }

    fn attrs() -> RouteAttributes {
        RouteAttributes::for_type(NetworkType::WIFI)
    }

    #[test]
    fn default_link_installs_routes_in_main_table() {
        let (mut rec, netd) = reconciler();
        let lp = wifi_link();

        assert!(rec.update_routes(Some(&lp), None, true, attrs(), None));

        let main: Vec<_> = netd.main_routes().into_iter().map(|r| r.route).collect();
        assert!(main.contains(&RouteInfo::default_via(ip("192.168.1.1"), Some("wlan0"))));
        assert!(main.contains(&RouteInfo::make_host_route(ip("192.168.1.1"), None, Some("wlan0"))));
        assert!(netd
            .calls()
            .iter()
            .any(|c| matches!(c, NetdCall::ReplaceSrcRoute { table: 101, gateway: Some(_), .. })));
    }

    #[test]
    fn identical_update_is_a_no_op() {
        let (mut rec, netd) = reconciler();
        let lp = wifi_link();
        rec.update_routes(Some(&lp), None, true, attrs(), None);
        netd.take_calls();

        assert!(!rec.update_routes(Some(&lp), Some(&lp), true, attrs(), None));
        assert!(netd.calls().is_empty());
    }

    #[test]
    fn shared_route_survives_until_last_user_leaves() {
        let (mut rec, netd) = reconciler();
        let route = RouteInfo::new("10.10.0.0/16".parse().unwrap(), None, Some("rmnet0"));
        let mut a = LinkProperties::new("rmnet0");
        a.add_route(route.clone());
        let b = a.clone();

        rec.update_routes(Some(&a), None, true, attrs(), None);
        rec.update_routes(Some(&b), None, false, attrs(), None);
        assert_eq!(rec.added_routes().count(&route), 2);

        rec.update_routes(None, Some(&a), true, attrs(), None);
        assert_eq!(netd.main_routes_on("rmnet0").len(), 1);

        rec.update_routes(None, Some(&b), false, attrs(), None);
        assert!(netd.main_routes_on("rmnet0").is_empty());
        let removals = netd
            .calls()
            .iter()
            .filter(|c| matches!(c, NetdCall::RemoveRoute { route: r, .. } if *r == route))
            .count();
        assert_eq!(removals, 1);
    }

    #[test]
    fn failed_kernel_add_is_not_counted() {
        let (mut rec, netd) = reconciler();
        netd.set_failing(true);
        rec.update_routes(Some(&wifi_link()), None, true, attrs(), None);
        assert!(rec.added_routes().is_empty());

        netd.set_failing(false);
        rec.update_routes(Some(&wifi_link()), None, true, attrs(), None);
        assert_eq!(netd.main_routes_on("wlan0").len(), 3);
    }

    #[test]
    fn non_default_link_uses_secondary_table_and_dns_host_routes() {
        let (mut rec, netd) = reconciler();
        let mut lp = LinkProperties::new("rmnet1");
        lp.add_address(LinkAddress::new(ip("10.1.1.2"), 30));
        lp.add_route(RouteInfo::default_via(ip("10.1.1.1"), None));
        lp.add_dns(ip("10.200.0.1"));
        let mms = RouteAttributes::for_type(NetworkType::MOBILE_MMS);

        rec.update_routes(Some(&lp), None, false, mms, None);

        let secondary = netd.secondary_routes(mms.table_id);
        assert_eq!(secondary.len(), 2);
        assert_eq!(secondary.iter().filter(|r| r.route.is_default_route()).count(), 1);
        let dns_route = RouteInfo::make_host_route(ip("10.200.0.1"), Some(ip("10.1.1.1")), Some("rmnet1"));
        assert!(netd.main_routes().iter().any(|r| r.route == dns_route));
        assert!(!netd.main_routes().iter().any(|r| r.route.is_default_route()));

        rec.update_routes(None, Some(&lp), false, mms, None);
        assert!(netd.main_routes().is_empty());
        assert!(netd.secondary_routes(mms.table_id).is_empty());
    }

    #[test]
    fn metric_applies_to_non_host_main_routes() {
        let (mut rec, netd) = reconciler();
        rec.update_routes(Some(&wifi_link()), None, true, attrs(), Some(10));

        for kernel in netd.main_routes() {
            if kernel.route.is_host_route() {
                assert_eq!(kernel.metric, None);
            } else {
                assert_eq!(kernel.metric, Some(10));
            }
        }
    }

    #[test]
    fn recursion_cap_skips_the_implied_route_only() {
        let netd = MockNetd::new();
        let mut rec = Reconciler::new(Arc::new(netd.clone()), 0);
        let mut lp = LinkProperties::new("eth0");
        lp.add_route(RouteInfo::new("10.0.0.0/8".parse().unwrap(), None, None));
        lp.add_route(RouteInfo::default_via(ip("10.0.0.1"), None));

        rec.update_routes(Some(&lp), None, true, attrs(), None);

        let main: Vec<_> = netd.main_routes().into_iter().map(|r| r.route).collect();
        assert_eq!(main.len(), 2);
        assert!(main.iter().all(|r| !r.is_host_route()));

        let err = rec
            .modify_route(&lp, &lp.routes[1], 1, Op::Add, Table::Main, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::RouteRecursion { cap: 0, .. }));
    }

    #[test]
    fn route_without_interface_is_rejected() {
        let (mut rec, netd) = reconciler();
        let lp = LinkProperties::default();
        let route = RouteInfo::make_host_route(ip("10.0.0.9"), None, None);
        let err = rec
            .modify_route(&lp, &route, 0, Op::Add, Table::Main, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingInterface(_)));
        assert!(netd.calls().is_empty());
    }

    #[test]
    fn default_routes_can_be_pulled_and_restored() {
        let (mut rec, netd) = reconciler();
        let lp = wifi_link();
        rec.update_routes(Some(&lp), None, true, attrs(), None);

        rec.remove_default_routes(&lp);
        assert!(!netd.main_routes().iter().any(|r| r.route.is_default_route()));

        rec.restore_default_routes(&lp, None);
        assert!(netd.main_routes().iter().any(|r| r.route.is_default_route()));
    }

    #[test]
    fn republish_replaces_default_with_new_metric() {
        let (mut rec, netd) = reconciler();
        let lp = wifi_link();
        rec.update_routes(Some(&lp), None, true, attrs(), None);

        rec.republish_default_routes(&lp, 10);

        let defaults: Vec<_> = netd
            .main_routes()
            .into_iter()
            .filter(|r| r.route.is_default_route())
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].metric, Some(10));
    }

    #[test]
    fn host_route_goes_through_best_gateway() {
        let lp = wifi_link();
        let remote = host_route_for(&lp, ip("8.8.4.4"));
        assert_eq!(remote.gateway, Some(ip("192.168.1.1")));
        let local = host_route_for(&lp, ip("192.168.1.7"));
        assert_eq!(local.gateway, None);
    }
}
