//! Kernel collaborator that only records what it would have done, for
//! unprivileged runs and tests.

use std::net::IpAddr;
use std::sync::Mutex;

use anyhow::Result;
use netpilot_core::{Netd, ResetMask, RouteInfo};
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoggingNetd {
    ops: Mutex<Vec<String>>,
}

impl LoggingNetd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, oldest first.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, op: String) {
        debug!(target: "route", "dry-run {}", op);
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

impl Netd for LoggingNetd {
    fn add_route(&self, iface: &str, route: &RouteInfo) -> Result<()> {
        self.record(format!("add_route {} {}", iface, route));
        Ok(())
    }

    fn remove_route(&self, iface: &str, route: &RouteInfo) -> Result<()> {
        self.record(format!("remove_route {} {}", iface, route));
        Ok(())
    }

    fn add_route_with_metric(&self, iface: &str, metric: u32, route: &RouteInfo) -> Result<()> {
        self.record(format!("add_route {} {} metric {}", iface, route, metric));
        Ok(())
    }

    fn add_secondary_route(&self, iface: &str, route: &RouteInfo, table_id: u32) -> Result<()> {
        self.record(format!("add_route {} {} table {}", iface, route, table_id));
        Ok(())
    }

    fn remove_secondary_route(
        &self,
        iface: &str,
        route: &RouteInfo,
        table_id: u32,
    ) -> Result<()> {
        self.record(format!("remove_route {} {} table {}", iface, route, table_id));
        Ok(())
    }

    fn replace_default_route(&self, iface: &str, gateway: IpAddr, metric: u32) -> Result<()> {
        self.record(format!(
            "replace_default {} via {} metric {}",
            iface, gateway, metric
        ));
        Ok(())
    }

    fn set_dns_servers_for_interface(&self, iface: &str, servers: &[IpAddr]) -> Result<()> {
        let servers: Vec<String> = servers.iter().map(IpAddr::to_string).collect();
        self.record(format!("dns {} [{}]", iface, servers.join(" ")));
        Ok(())
    }

    fn set_default_interface_for_dns(&self, iface: &str) -> Result<()> {
        self.record(format!("dns_default {}", iface));
        Ok(())
    }

    fn flush_interface_dns_cache(&self, iface: &str) -> Result<()> {
        self.record(format!("dns_flush {}", iface));
        Ok(())
    }

    fn replace_src_route(
        &self,
        iface: &str,
        local: IpAddr,
        gateway: Option<IpAddr>,
        table_id: u32,
    ) -> Result<()> {
        let via = gateway.map(|g| g.to_string()).unwrap_or_else(|| "link".to_string());
        self.record(format!(
            "src_route {} from {} via {} table {}",
            iface, local, via, table_id
        ));
        Ok(())
    }

    fn del_src_route(&self, local: IpAddr, table_id: u32) -> Result<()> {
        self.record(format!("del_src_route {} table {}", local, table_id));
        Ok(())
    }

    fn reset_connections(&self, iface: &str, mask: ResetMask) -> Result<()> {
        self.record(format!("reset {} {}", iface, mask));
        Ok(())
    }

    fn set_tcp_buffer_sizes(&self, sizes: &str) -> Result<()> {
        self.record(format!("tcp_buffers {}", sizes));
        Ok(())
    }
}
