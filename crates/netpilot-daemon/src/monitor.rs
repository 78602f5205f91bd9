//! Feeds the trackers from sysfs and rtnetlink. A pass runs on every link,
//! address or route notification from the kernel, with the interval poll as
//! a fallback. Trackers wake the poll early when the service asks for a
//! reconnect or a data setting changes.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use netpilot_netlink::NetlinkEvent;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netpilot_core::LinkAddress;

use crate::state::DaemonState;
use crate::tracker::{InterfaceTracker, Observation};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Link state as sysfs reports it: `(ifindex, oper_up)`. `None` when the
/// interface does not exist.
pub fn read_link_state(sys_class_net: &Path, iface: &str) -> Option<(u32, bool)> {
    let dir = sys_class_net.join(iface);
    let index = fs::read_to_string(dir.join("ifindex"))
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()?;
    let operstate = fs::read_to_string(dir.join("operstate")).unwrap_or_default();
    // Point-to-point modems usually report "unknown" while passing traffic.
    let up = matches!(operstate.trim(), "up" | "unknown");
    Some((index, up))
}

async fn observe(tracker: &InterfaceTracker, default_gateways: &[(u32, IpAddr)]) -> Observation {
    let Some((index, oper_up)) = read_link_state(Path::new(SYS_CLASS_NET), tracker.interface())
    else {
        return Observation::default();
    };
    let addresses = if oper_up {
        match netpilot_netlink::list_addresses(index).await {
            Ok(addresses) => addresses
                .into_iter()
                .filter(|a| a.is_routable())
                .map(|a| LinkAddress::new(a.address, a.prefix_len))
                .collect(),
            Err(err) => {
                warn!(target: "net", "Listing addresses of {} failed: {}", tracker.interface(), err);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    let gateway = default_gateways
        .iter()
        .find(|(oif, _)| *oif == index)
        .map(|(_, gw)| *gw);
    Observation {
        present: true,
        oper_up,
        addresses,
        gateway,
    }
}

/// `(oif, gateway)` of every default route in the main table.
async fn default_gateways() -> Vec<(u32, IpAddr)> {
    match netpilot_netlink::list_routes().await {
        Ok(routes) => routes
            .into_iter()
            .filter(|r| r.is_default() && r.table == netpilot_netlink::MAIN_TABLE)
            .filter_map(|r| Some((r.interface_index?, r.gateway?)))
            .collect(),
        Err(err) => {
            debug!(target: "net", "Route dump failed: {}", err);
            Vec::new()
        }
    }
}

async fn poll_once(trackers: &[Arc<InterfaceTracker>]) {
    let gateways = default_gateways().await;
    for tracker in trackers {
        let obs = observe(tracker, &gateways).await;
        tracker.observe(obs);
    }
}

/// Waits for the next kernel notification and swallows the rest of its
/// burst. Pends forever once the subscription is gone.
async fn next_event_burst(events: &mut Option<UnboundedReceiver<NetlinkEvent>>) -> usize {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    let Some(first) = rx.recv().await else {
        warn!(target: "net", "Netlink event stream closed, polling only");
        *events = None;
        return std::future::pending().await;
    };
    debug!(target: "net", "Kernel notification {:?}", first);
    let mut count = 1;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

pub async fn run_interface_monitor(state: Arc<DaemonState>, cancel: CancellationToken) {
    if state.trackers.is_empty() {
        info!(target: "net", "No interfaces configured, monitor idle");
        return;
    }
    info!(target: "net", "Monitoring {}", state.tracker_names().join(", "));
    let mut events = match netpilot_netlink::events::subscribe() {
        Ok(rx) => Some(rx),
        Err(err) => {
            warn!(target: "net", "Netlink events unavailable, polling only: {}", err);
            None
        }
    };
    let mut interval = tokio::time::interval(state.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(target: "net", "Interface monitor stopped by shutdown signal");
                break;
            }
            _ = interval.tick() => {}
            count = next_event_burst(&mut events) => {
                debug!(target: "net", "{} kernel notifications, refreshing", count);
            }
            _ = state.monitor_wake.notified() => {
                debug!(target: "net", "Interface monitor woken early");
            }
        }
        poll_once(&state.trackers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_iface(root: &Path, name: &str, index: &str, operstate: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ifindex"), index).unwrap();
        fs::write(dir.join("operstate"), operstate).unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn event_bursts_are_coalesced() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(NetlinkEvent::Link(3)).unwrap();
        tx.send(NetlinkEvent::Address(3)).unwrap();
        tx.send(NetlinkEvent::Route).unwrap();
        let mut events = Some(rx);

        assert_eq!(next_event_burst(&mut events).await, 3);

        drop(tx);
        let closed = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            next_event_burst(&mut events),
        )
        .await;
        assert!(closed.is_err());
        assert!(events.is_none());
    }

    #[test]
    fn sysfs_link_state() {
        let temp_dir = TempDir::new().unwrap();
        write_iface(temp_dir.path(), "wlan0", "3\n", "up\n");
        write_iface(temp_dir.path(), "eth0", "2\n", "down\n");
        write_iface(temp_dir.path(), "wwan0", "5\n", "unknown\n");

        assert_eq!(read_link_state(temp_dir.path(), "wlan0"), Some((3, true)));
        assert_eq!(read_link_state(temp_dir.path(), "eth0"), Some((2, false)));
        assert_eq!(read_link_state(temp_dir.path(), "wwan0"), Some((5, true)));
        assert_eq!(read_link_state(temp_dir.path(), "usb0"), None);
    }
}
