use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use netpilot_core::NetworkType;
use netpilot_ipc::MAX_FRAME;
use tracing::warn;

pub const DEFAULT_SOCKET_PATH: &str = "/run/netpilot/netpilotd.sock";
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_ADMIN_GROUP: &str = "netpilot-admin";
pub const DEFAULT_OPERATOR_GROUP: &str = "netpilot";
pub const DEFAULT_ROOT_PATH: &str = "/var/lib/netpilot";
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 20;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_BROADCAST_HISTORY: usize = 256;
pub const DEFAULT_INTERFACES: &str = "wifi=wlan0,ethernet=eth0";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub max_frame: u32,
    pub socket_group: Option<String>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub admin_group: String,
    pub operator_group: String,
    pub root_path: PathBuf,
    pub max_connections: usize,
    pub max_requests_per_second: u32,
    /// When false, kernel calls are logged instead of issued.
    pub kernel_routes: bool,
    pub resolv_conf: PathBuf,
    pub interfaces: Vec<(NetworkType, String)>,
    pub interface_dns: HashMap<String, Vec<IpAddr>>,
    pub poll_interval: Duration,
    pub broadcast_history: usize,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let socket_path = env::var("NETPILOTD_SOCKET")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        let max_frame = env::var("NETPILOTD_MAX_FRAME")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(MAX_FRAME);
        let socket_group = env::var("NETPILOTD_SOCKET_GROUP").ok();
        let read_timeout_ms = env::var("NETPILOTD_READ_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_READ_TIMEOUT_MS);
        let write_timeout_ms = env::var("NETPILOTD_WRITE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS);
        let admin_group =
            env::var("NETPILOTD_ADMIN_GROUP").unwrap_or_else(|_| DEFAULT_ADMIN_GROUP.to_string());
        let operator_group = env::var("NETPILOTD_OPERATOR_GROUP")
            .unwrap_or_else(|_| DEFAULT_OPERATOR_GROUP.to_string());
        let root_path = env::var("NETPILOT_ROOT")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_PATH));
        let max_connections = env::var("NETPILOTD_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let max_requests_per_second = env::var("NETPILOTD_MAX_REQUESTS_PER_SECOND")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_REQUESTS_PER_SECOND);
        let kernel_routes = env_bool("NETPILOTD_KERNEL_ROUTES", true);
        let resolv_conf = env::var("NETPILOTD_RESOLV_CONF")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLV_CONF));
        let interfaces = parse_interfaces(
            &env_list("NETPILOTD_INTERFACES").unwrap_or_else(|| {
                DEFAULT_INTERFACES.split(',').map(str::to_string).collect()
            }),
        );
        let interface_dns = env::var("NETPILOTD_DNS")
            .map(|v| parse_interface_dns(&v))
            .unwrap_or_default();
        let poll_interval_ms = env::var("NETPILOTD_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let broadcast_history = env::var("NETPILOTD_BROADCAST_HISTORY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BROADCAST_HISTORY);

        Self {
            socket_path,
            max_frame,
            socket_group,
            read_timeout: Duration::from_millis(read_timeout_ms),
            write_timeout: Duration::from_millis(write_timeout_ms),
            admin_group,
            operator_group,
            root_path,
            max_connections,
            max_requests_per_second,
            kernel_routes,
            resolv_conf,
            interfaces,
            interface_dns,
            poll_interval: Duration::from_millis(poll_interval_ms.max(100)),
            broadcast_history,
        }
    }
}

/// `type=iface` pairs. Unknown types and repeated types are skipped.
fn parse_interfaces(items: &[String]) -> Vec<(NetworkType, String)> {
    let mut out: Vec<(NetworkType, String)> = Vec::new();
    for item in items {
        let Some((kind, iface)) = item.split_once('=') else {
            warn!("Ignoring interface entry without '=': {}", item);
            continue;
        };
        let iface = iface.trim();
        let network_type = match kind.parse::<NetworkType>() {
            Ok(t) => t,
            Err(err) => {
                warn!("Ignoring interface entry {}: {}", item, err);
                continue;
            }
        };
        if iface.is_empty() || out.iter().any(|(t, _)| *t == network_type) {
            warn!("Ignoring interface entry {}", item);
            continue;
        }
        out.push((network_type, iface.to_string()));
    }
    out
}

/// `wlan0=1.1.1.1 9.9.9.9;eth0=10.0.0.1`
fn parse_interface_dns(value: &str) -> HashMap<String, Vec<IpAddr>> {
    let mut out = HashMap::new();
    for entry in value.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((iface, servers)) = entry.split_once('=') else {
            warn!("Ignoring DNS entry without '=': {}", entry);
            continue;
        };
        let servers: Vec<IpAddr> = servers
            .split_whitespace()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Ignoring DNS server {} for {}", s, iface);
                    None
                }
            })
            .collect();
        out.insert(iface.trim().to_string(), servers);
    }
    out
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|s| {
        s.split(',')
            .map(|x| x.trim().to_ascii_lowercase())
            .filter(|x| !x.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            if !self.vars.iter().any(|(k, _)| k == key) {
                self.vars.push((key.to_string(), std::env::var(key).ok()));
            }
            std::env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            if !self.vars.iter().any(|(k, _)| k == key) {
                self.vars.push((key.to_string(), std::env::var(key).ok()));
            }
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        for key in [
            "NETPILOTD_SOCKET",
            "NETPILOTD_INTERFACES",
            "NETPILOTD_KERNEL_ROUTES",
            "NETPILOTD_DNS",
            "NETPILOT_ROOT",
        ] {
            guard.remove(key);
        }

        let cfg = DaemonConfig::from_env();
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(cfg.root_path, PathBuf::from(DEFAULT_ROOT_PATH));
        assert!(cfg.kernel_routes);
        assert_eq!(
            cfg.interfaces,
            vec![
                (NetworkType::WIFI, "wlan0".to_string()),
                (NetworkType::ETHERNET, "eth0".to_string()),
            ]
        );
        assert!(cfg.interface_dns.is_empty());
    }

    #[test]
    fn interfaces_and_dns_from_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("NETPILOTD_INTERFACES", "mobile=wwan0, bogus=x, mobile=wwan1,wifi=wlp2s0");
        guard.set("NETPILOTD_DNS", "wwan0=10.0.0.1 nope 10.0.0.2;wlp2s0=1.1.1.1");
        guard.set("NETPILOTD_KERNEL_ROUTES", "false");

        let cfg = DaemonConfig::from_env();
        assert!(!cfg.kernel_routes);
        assert_eq!(
            cfg.interfaces,
            vec![
                (NetworkType::MOBILE, "wwan0".to_string()),
                (NetworkType::WIFI, "wlp2s0".to_string()),
            ]
        );
        assert_eq!(
            cfg.interface_dns.get("wwan0"),
            Some(&vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ])
        );
        assert_eq!(cfg.interface_dns.get("wlp2s0").map(Vec::len), Some(1));
    }
}
