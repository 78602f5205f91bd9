//! Kernel routing and resolver collaborator.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use netpilot_netlink::{ResolverWriter, RouteManager, RouteSpec, RuleManager, TcpBufferSizes};
use tracing::{debug, info};

use crate::link::RouteInfo;

/// Which address families lose their sockets when an interface changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetMask(u8);

impl ResetMask {
    pub const NONE: ResetMask = ResetMask(0);
    pub const IPV4: ResetMask = ResetMask(1);
    pub const IPV6: ResetMask = ResetMask(2);
    pub const ALL: ResetMask = ResetMask(3);

    pub fn for_address(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::IPV4,
            IpAddr::V6(_) => Self::IPV6,
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ResetMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ResetMask {
    type Output = ResetMask;

    fn bitor(self, rhs: ResetMask) -> ResetMask {
        ResetMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResetMask {
    fn bitor_assign(&mut self, rhs: ResetMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResetMask::NONE => f.write_str("none"),
            ResetMask::IPV4 => f.write_str("ipv4"),
            ResetMask::IPV6 => f.write_str("ipv6"),
            _ => f.write_str("all"),
        }
    }
}

/// Kernel-facing operations issued by the reconciler. Every call is best
/// effort from the caller's point of view: failures are logged and the
/// reconciliation continues.
pub trait Netd: Send + Sync {
    fn add_route(&self, iface: &str, route: &RouteInfo) -> Result<()>;
    fn remove_route(&self, iface: &str, route: &RouteInfo) -> Result<()>;
    fn add_route_with_metric(&self, iface: &str, metric: u32, route: &RouteInfo) -> Result<()>;
    fn add_secondary_route(&self, iface: &str, route: &RouteInfo, table_id: u32) -> Result<()>;
    fn remove_secondary_route(&self, iface: &str, route: &RouteInfo, table_id: u32)
        -> Result<()>;
    fn replace_default_route(&self, iface: &str, gateway: IpAddr, metric: u32) -> Result<()>;

    fn set_dns_servers_for_interface(&self, iface: &str, servers: &[IpAddr]) -> Result<()>;
    fn set_default_interface_for_dns(&self, iface: &str) -> Result<()>;
    fn flush_interface_dns_cache(&self, iface: &str) -> Result<()>;

    fn replace_src_route(
        &self,
        iface: &str,
        local: IpAddr,
        gateway: Option<IpAddr>,
        table_id: u32,
    ) -> Result<()>;
    fn del_src_route(&self, local: IpAddr, table_id: u32) -> Result<()>;

    fn reset_connections(&self, iface: &str, mask: ResetMask) -> Result<()>;
    fn set_tcp_buffer_sizes(&self, sizes: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct ResolverState {
    servers: HashMap<String, Vec<IpAddr>>,
    default_interface: Option<String>,
}

/// Netd backed by rtnetlink and a resolver file.
///
/// The worker thread is not a tokio thread, so the netlink connection lives on
/// a small private runtime and every call blocks on it.
pub struct RealNetd {
    runtime: Option<tokio::runtime::Runtime>,
    routes: RouteManager,
    rules: RuleManager,
    resolver: ResolverWriter,
    dns: Mutex<ResolverState>,
}

impl RealNetd {
    /// Must not be called from inside an async context.
    pub fn new(resolv_conf: PathBuf) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("netpilot-netlink")
            .enable_all()
            .build()
            .context("building netlink runtime")?;
        let (routes, rules) = runtime
            .block_on(async {
                Ok::<_, netpilot_netlink::NetlinkError>((RouteManager::new()?, RuleManager::new()?))
            })
            .context("opening rtnetlink connections")?;
        info!("Kernel route manager ready, resolver at {}", resolv_conf.display());
        Ok(Self {
            runtime: Some(runtime),
            routes,
            rules,
            resolver: ResolverWriter::new(resolv_conf),
            dns: Mutex::new(ResolverState::default()),
        })
    }

    fn block_on<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = netpilot_netlink::Result<T>>,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("netlink runtime already shut down"))?;
        runtime
            .block_on(fut)
            .map_err(|e| anyhow!("{} failed: {}", what, e))
    }

    fn spec(iface: &str, route: &RouteInfo, table: Option<u32>, metric: Option<u32>) -> RouteSpec {
        RouteSpec {
            destination: route.destination,
            gateway: route.gateway,
            interface: route
                .interface
                .clone()
                .unwrap_or_else(|| iface.to_string()),
            table,
            metric,
        }
    }

    fn rewrite_resolver(&self) -> Result<()> {
        let (servers, default_iface) = {
            let dns = self.dns.lock().unwrap_or_else(|e| e.into_inner());
            let iface = dns.default_interface.clone();
            let servers = iface
                .as_ref()
                .and_then(|i| dns.servers.get(i).cloned())
                .unwrap_or_default();
            (servers, iface)
        };
        if default_iface.is_none() {
            return Ok(());
        }
        self.resolver
            .write(&servers)
            .map_err(|e| anyhow!("writing resolver file: {}", e))
    }
}

impl Drop for RealNetd {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Netd for RealNetd {
    fn add_route(&self, iface: &str, route: &RouteInfo) -> Result<()> {
        let spec = Self::spec(iface, route, None, None);
        self.block_on("add route", self.routes.add_route(&spec))
    }

    fn remove_route(&self, iface: &str, route: &RouteInfo) -> Result<()> {
        let spec = Self::spec(iface, route, None, None);
        self.block_on("remove route", self.routes.delete_route(&spec))
    }

    fn add_route_with_metric(&self, iface: &str, metric: u32, route: &RouteInfo) -> Result<()> {
        let spec = Self::spec(iface, route, None, Some(metric));
        self.block_on("add route with metric", self.routes.add_route(&spec))
    }

    fn add_secondary_route(&self, iface: &str, route: &RouteInfo, table_id: u32) -> Result<()> {
        let spec = Self::spec(iface, route, Some(table_id), None);
        self.block_on("add secondary route", self.routes.add_route(&spec))
    }

    fn remove_secondary_route(
        &self,
        iface: &str,
        route: &RouteInfo,
        table_id: u32,
    ) -> Result<()> {
        let spec = Self::spec(iface, route, Some(table_id), None);
        self.block_on("remove secondary route", self.routes.delete_route(&spec))
    }

    fn replace_default_route(&self, iface: &str, gateway: IpAddr, metric: u32) -> Result<()> {
        self.block_on(
            "replace default route",
            self.routes.replace_default_route(gateway, iface, Some(metric)),
        )
    }

    fn set_dns_servers_for_interface(&self, iface: &str, servers: &[IpAddr]) -> Result<()> {
        let is_default = {
            let mut dns = self.dns.lock().unwrap_or_else(|e| e.into_inner());
            dns.servers.insert(iface.to_string(), servers.to_vec());
            dns.default_interface.as_deref() == Some(iface)
        };
        if is_default {
            self.rewrite_resolver()?;
        }
        Ok(())
    }

    fn set_default_interface_for_dns(&self, iface: &str) -> Result<()> {
        {
            let mut dns = self.dns.lock().unwrap_or_else(|e| e.into_inner());
            dns.default_interface = Some(iface.to_string());
        }
        self.rewrite_resolver()
    }

    fn flush_interface_dns_cache(&self, iface: &str) -> Result<()> {
        // no resolver cache of our own; the rewritten file is picked up on next lookup
        debug!("DNS cache flush requested for {}", iface);
        Ok(())
    }

    fn replace_src_route(
        &self,
        iface: &str,
        local: IpAddr,
        gateway: Option<IpAddr>,
        table_id: u32,
    ) -> Result<()> {
        self.block_on("replace source rule", self.rules.replace_source_rule(local, table_id))?;
        if let Some(gateway) = gateway {
            let route = RouteInfo::default_via(gateway, Some(iface));
            let spec = Self::spec(iface, &route, Some(table_id), None);
            self.block_on("replace source table default", self.routes.replace_route(&spec))?;
        }
        Ok(())
    }

    fn del_src_route(&self, local: IpAddr, table_id: u32) -> Result<()> {
        self.block_on("delete source rule", self.rules.delete_source_rule(local, table_id))
    }

    fn reset_connections(&self, iface: &str, mask: ResetMask) -> Result<()> {
        // No sock_diag destroy support yet; sockets on the old address time out.
        debug!("Socket reset ({}) on {} unsupported, skipping", mask, iface);
        Ok(())
    }

    fn set_tcp_buffer_sizes(&self, sizes: &str) -> Result<()> {
        let sizes: TcpBufferSizes = sizes
            .parse()
            .map_err(|e| anyhow!("invalid tcp buffer sizes '{}': {}", sizes, e))?;
        netpilot_netlink::set_tcp_buffer_sizes(&sizes)
            .map_err(|e| anyhow!("setting tcp buffer sizes: {}", e))
    }
}
