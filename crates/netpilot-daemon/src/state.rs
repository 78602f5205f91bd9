use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use netpilot_core::{
    Broadcast, BroadcastSink, ConnectivityService, CoreConfig, EventSink, Netd,
    NetworkStateTracker, NetworkType, RealNetd, ServiceHandle, ServiceParts, SettingsStore,
    Variant,
};
use netpilot_ipc::BroadcastRecord;

use crate::config::DaemonConfig;
use crate::netd::LoggingNetd;
use crate::tracker::InterfaceTracker;

/// Most recent broadcasts, oldest first, for clients that poll.
pub struct BroadcastLog {
    capacity: usize,
    inner: Mutex<BroadcastRing>,
}

#[derive(Default)]
struct BroadcastRing {
    next_seq: u64,
    records: VecDeque<BroadcastRecord>,
}

impl BroadcastLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BroadcastRing::default()),
        }
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<BroadcastRecord> {
        let ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.records.len().saturating_sub(limit);
        ring.records.iter().skip(skip).cloned().collect()
    }
}

impl BroadcastSink for BroadcastLog {
    fn send(&self, broadcast: Broadcast) {
        debug!("broadcast {:?}", broadcast);
        let mut ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        ring.next_seq += 1;
        let record = BroadcastRecord {
            seq: ring.next_seq,
            at_ms: Utc::now().timestamp_millis().max(0) as u64,
            broadcast,
        };
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(record);
    }
}

pub struct DaemonState {
    pub config: DaemonConfig,
    pub start_time: Instant,
    pub version: String,
    pub variant: Variant,
    pub service: ServiceHandle,
    pub broadcasts: Arc<BroadcastLog>,
    pub trackers: Vec<Arc<InterfaceTracker>>,
    /// Wakes the interface monitor ahead of its next poll.
    pub monitor_wake: Arc<Notify>,
}

impl DaemonState {
    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn tracker_names(&self) -> Vec<String> {
        self.trackers
            .iter()
            .map(|t| format!("{}={}", t.network_type(), t.interface()))
            .collect()
    }
}

/// The running service plus the state shared with connection handlers.
pub struct Daemon {
    pub state: Arc<DaemonState>,
    pub service: ConnectivityService,
}

impl Daemon {
    /// Loads `netpilot.json`, builds the kernel collaborator and trackers, and
    /// starts the connectivity worker. Blocks; call from a blocking context.
    pub fn build(config: DaemonConfig) -> Result<Self> {
        let core_config = CoreConfig::load(&CoreConfig::config_path(&config.root_path))
            .context("loading core config")?;
        let variant = core_config.variant;
        let netd = build_netd(&config)?;
        let monitor_wake = Arc::new(Notify::new());

        let trackers: Vec<Arc<InterfaceTracker>> = config
            .interfaces
            .iter()
            .map(|(network_type, iface)| {
                let dns = config.interface_dns.get(iface).cloned().unwrap_or_default();
                Arc::new(InterfaceTracker::new(
                    *network_type,
                    iface.clone(),
                    dns,
                    Arc::clone(&monitor_wake),
                ))
            })
            .collect();
        let tracker_parts: Vec<(NetworkType, Arc<dyn NetworkStateTracker>)> = trackers
            .iter()
            .map(|t| (t.network_type(), Arc::clone(t) as Arc<dyn NetworkStateTracker>))
            .collect();

        let broadcasts = Arc::new(BroadcastLog::new(config.broadcast_history));
        let service = ConnectivityService::start(ServiceParts {
            config: core_config,
            trackers: tracker_parts,
            netd,
            broadcasts: Arc::clone(&broadcasts) as Arc<dyn BroadcastSink>,
            settings: Some(SettingsStore::new(&config.root_path)),
        })
        .context("starting connectivity service")?;

        let handle = service.handle();
        let sink: Arc<dyn EventSink> = Arc::new(handle.clone());
        for tracker in &trackers {
            tracker.attach(Arc::clone(&sink));
        }
        info!(
            "Service up with {} tracker(s), kernel routes {}",
            trackers.len(),
            if config.kernel_routes { "on" } else { "dry-run" }
        );

        let state = Arc::new(DaemonState {
            config,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            variant,
            service: handle,
            broadcasts,
            trackers,
            monitor_wake,
        });
        Ok(Self { state, service })
    }
}

fn build_netd(config: &DaemonConfig) -> Result<Arc<dyn Netd>> {
    if !config.kernel_routes {
        return Ok(Arc::new(LoggingNetd::new()));
    }
    // RealNetd owns a private runtime, which must not start inside this one.
    let resolv_conf = config.resolv_conf.clone();
    let netd = std::thread::Builder::new()
        .name("netd-init".to_string())
        .spawn(move || RealNetd::new(resolv_conf))
        .context("spawning netd init thread")?
        .join()
        .map_err(|_| anyhow!("netd init thread panicked"))??;
    Ok(Arc::new(netd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_change() -> Broadcast {
        Broadcast::ProxyChange { proxy: None }
    }

    #[test]
    fn broadcast_log_keeps_the_newest() {
        let log = BroadcastLog::new(2);
        log.send(proxy_change());
        log.send(proxy_change());
        log.send(Broadcast::DnsChange {
            servers: Vec::new(),
            counter: 7,
        });

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].seq, 2);
        assert_eq!(recent[1].seq, 3);
        assert!(matches!(
            recent[1].broadcast,
            Broadcast::DnsChange { counter: 7, .. }
        ));
        assert_eq!(log.recent(1)[0].seq, 3);
    }
}
