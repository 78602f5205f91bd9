//! Published resolver state for the default network.

use std::net::IpAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsOverride {
    pub interface: String,
    pub servers: Vec<IpAddr>,
    pub domains: Option<String>,
}

#[derive(Debug, Default)]
struct DnsInner {
    /// `dns1..dnsN`, in resolver order.
    entries: Vec<IpAddr>,
    interface: Option<String>,
    domains: Option<String>,
    counter: u64,
    overridden: Option<DnsOverride>,
}

/// Result of a publish that changed something and must reach netd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsUpdate {
    pub interface: String,
    pub servers: Vec<IpAddr>,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSnapshot {
    pub interface: Option<String>,
    pub servers: Vec<IpAddr>,
    pub domains: Option<String>,
    pub counter: u64,
    pub overridden: bool,
}

pub struct DnsState {
    default_server: IpAddr,
    inner: Mutex<DnsInner>,
}

impl DnsState {
    pub fn new(default_server: IpAddr) -> Self {
        Self {
            default_server,
            inner: Mutex::new(DnsInner::default()),
        }
    }

    pub fn default_server(&self) -> IpAddr {
        self.default_server
    }

    /// Records `servers` (or the fallback server when empty) as the published
    /// set for `interface`. Returns `None` when nothing changed.
    pub fn publish(
        &self,
        interface: &str,
        servers: &[IpAddr],
        domains: Option<&str>,
    ) -> Option<DnsUpdate> {
        let servers = if servers.is_empty() {
            vec![self.default_server]
        } else {
            servers.to_vec()
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let changed = inner.entries != servers
            || inner.interface.as_deref() != Some(interface)
            || inner.domains.as_deref() != domains;
        if !changed {
            return None;
        }
        inner.entries = servers.clone();
        inner.interface = Some(interface.to_string());
        inner.domains = domains.map(str::to_string);
        inner.counter += 1;
        Some(DnsUpdate {
            interface: interface.to_string(),
            servers,
            counter: inner.counter,
        })
    }

    pub fn set_override(&self, overridden: Option<DnsOverride>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.overridden = overridden;
    }

    pub fn is_overridden(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.overridden.is_some()
    }

    /// `("dns1", addr), ("dns2", addr), ...`
    pub fn numbered(&self) -> Vec<(String, IpAddr)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .iter()
            .enumerate()
            .map(|(i, addr)| (format!("dns{}", i + 1), *addr))
            .collect()
    }

    pub fn snapshot(&self) -> DnsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        DnsSnapshot {
            interface: inner.interface.clone(),
            servers: inner.entries.clone(),
            domains: inner.domains.clone(),
            counter: inner.counter,
            overridden: inner.overridden.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn publish_reports_only_changes() {
        let dns = DnsState::new(ip("8.8.8.8"));
        let first = dns
            .publish("wlan0", &[ip("192.168.1.1"), ip("1.1.1.1")], None)
            .unwrap();
        assert_eq!(first.counter, 1);
        assert!(dns
            .publish("wlan0", &[ip("192.168.1.1"), ip("1.1.1.1")], None)
            .is_none());

        let moved = dns.publish("eth0", &[ip("192.168.1.1"), ip("1.1.1.1")], None);
        assert_eq!(moved.unwrap().counter, 2);
    }

    #[test]
    fn shorter_list_clears_trailing_entries() {
        let dns = DnsState::new(ip("8.8.8.8"));
        dns.publish("wlan0", &[ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")], None);
        dns.publish("wlan0", &[ip("10.0.0.9")], None);
        assert_eq!(dns.numbered(), vec![("dns1".to_string(), ip("10.0.0.9"))]);
    }

    #[test]
    fn empty_list_falls_back_to_default_server() {
        let dns = DnsState::new(ip("8.8.8.8"));
        let update = dns.publish("rmnet0", &[], Some("example.net")).unwrap();
        assert_eq!(update.servers, vec![ip("8.8.8.8")]);
        assert_eq!(dns.snapshot().domains.as_deref(), Some("example.net"));
    }
}
