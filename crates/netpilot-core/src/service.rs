//! The connectivity service: a worker thread owning the state machine and a
//! cloneable handle exposing the public API.

use std::net::IpAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastSink;
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::connectivity::{Connectivity, Shared, Snapshot};
use crate::dns::{DnsOverride, DnsSnapshot};
use crate::error::{CoreError, Result};
use crate::features::{FeatureRequest, FeatureUser, StartResult, StopResult};
use crate::hsm::fmc::FmcStatus;
use crate::hsm::message::Message;
use crate::hsm::StateMachine;
use crate::link::LinkProperties;
use crate::netd::Netd;
use crate::policy::UidRule;
use crate::proxy::ProxyInfo;
use crate::settings::{Settings, SettingsStore};
use crate::tracker::{EventSink, NetworkStateTracker, TrackerEvent};
use crate::types::{NetworkInfo, NetworkType};
use crate::wakelock::WakelockStatus;

enum Envelope {
    Post(Message),
    PostDelayed(Message, Duration),
    Shutdown,
}

/// Collaborators handed to [`ConnectivityService::start`].
pub struct ServiceParts {
    pub config: CoreConfig,
    pub trackers: Vec<(NetworkType, Arc<dyn NetworkStateTracker>)>,
    pub netd: Arc<dyn Netd>,
    pub broadcasts: Arc<dyn BroadcastSink>,
    pub settings: Option<SettingsStore>,
}

pub struct ConnectivityService {
    handle: ServiceHandle,
    worker: Option<JoinHandle<()>>,
}

impl ConnectivityService {
    pub fn start(parts: ServiceParts) -> Result<Self> {
        let settings = match &parts.settings {
            Some(store) => store.load().unwrap_or_else(|err| {
                warn!("Ignoring unreadable settings: {:#}", err);
                Settings::default()
            }),
            None => Settings::default(),
        };

        let shared = Arc::new(Shared::new(
            parts.config,
            parts.trackers,
            parts.netd,
            parts.broadcasts,
            parts.settings,
            &settings,
        ));
        let mut ctx = Connectivity::new(shared.clone(), &settings);
        let mobile_data = ctx.mobile_data_enabled;
        ctx.set_mobile_data(mobile_data, false);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("connectivity".to_string())
            .spawn(move || {
                let machine = StateMachine::new(ctx, clock);
                run_worker(machine, rx);
            })
            .map_err(|e| CoreError::io("spawning connectivity worker", e))?;

        let preference = settings
            .network_preference
            .unwrap_or(shared.config.default_network_preference);
        info!(
            "Connectivity service started ({:?}, preference {})",
            shared.config.variant, preference
        );
        Ok(Self {
            handle: ServiceHandle { tx, shared },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Stops the worker after it drains what is already queued.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.handle.tx.send(Envelope::Shutdown);
        if worker.join().is_err() {
            error!("Connectivity worker panicked");
        }
    }
}

impl Drop for ConnectivityService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(mut machine: StateMachine, rx: mpsc::Receiver<Envelope>) {
    debug!(target: "hsm", "Worker running in {}", machine.current());
    loop {
        machine.process_due();
        let envelope = match machine.next_due() {
            Some(due) => rx.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match envelope {
            Ok(Envelope::Post(msg)) => machine.post(msg),
            Ok(Envelope::PostDelayed(msg, delay)) => machine.post_delayed(msg, delay),
            Ok(Envelope::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    machine.process_due();
    info!("Connectivity worker stopped");
}

/// Cloneable entry point for API callers and trackers.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
}

impl ServiceHandle {
    fn post(&self, msg: Message) -> Result<()> {
        self.tx
            .send(Envelope::Post(msg))
            .map_err(|_| CoreError::ServiceStopped)
    }

    fn post_delayed(&self, msg: Message, delay: Duration) -> Result<()> {
        self.tx
            .send(Envelope::PostDelayed(msg, delay))
            .map_err(|_| CoreError::ServiceStopped)
    }

    fn configured(&self, network_type: NetworkType) -> Result<()> {
        if self.shared.table.is_configured(network_type) {
            Ok(())
        } else {
            Err(CoreError::NetworkNotConfigured(network_type))
        }
    }

    fn is_metered(&self, network_type: NetworkType) -> bool {
        self.shared
            .table
            .get(network_type)
            .is_some_and(|c| c.metered)
    }

    fn filtered_info(&self, network_type: NetworkType, uid: u32) -> Option<NetworkInfo> {
        let tracker = self.shared.trackers.get(network_type)?;
        let info = tracker.network_info();
        Some(
            self.shared
                .policy
                .filter_info(&info, uid, self.is_metered(network_type)),
        )
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot()
    }

    pub fn active_network_info(&self, uid: u32) -> Option<NetworkInfo> {
        let active = self.snapshot().active_default?;
        self.filtered_info(active, uid)
    }

    pub fn network_info(&self, network_type: NetworkType, uid: u32) -> Result<Option<NetworkInfo>> {
        self.configured(network_type)?;
        Ok(self.filtered_info(network_type, uid))
    }

    pub fn all_network_info(&self, uid: u32) -> Vec<NetworkInfo> {
        self.shared
            .trackers
            .iter()
            .filter_map(|(t, _)| self.filtered_info(t, uid))
            .collect()
    }

    pub fn active_link_properties(&self) -> Option<LinkProperties> {
        let snapshot = self.snapshot();
        let active = snapshot.active_default?;
        snapshot.link(active).cloned()
    }

    pub fn link_properties(&self, network_type: NetworkType) -> Result<Option<LinkProperties>> {
        self.configured(network_type)?;
        Ok(self.snapshot().link(network_type).cloned())
    }

    pub fn is_active_network_metered(&self) -> bool {
        self.snapshot()
            .active_default
            .is_some_and(|t| self.is_metered(t))
    }

    pub fn is_network_supported(&self, network_type: NetworkType) -> bool {
        self.shared.trackers.get(network_type).is_some()
    }

    pub fn network_preference(&self) -> NetworkType {
        self.snapshot().network_preference
    }

    pub fn set_network_preference(&self, preference: NetworkType) -> Result<()> {
        if !self.shared.table.is_default(preference) {
            return Err(CoreError::invalid_argument(
                "preference",
                preference.to_string(),
                "not a default network type",
            ));
        }
        self.post(Message::SetNetworkPreference(preference))
    }

    pub fn start_using_network_feature(
        &self,
        network_type: NetworkType,
        feature: &str,
        pid: u32,
        uid: u32,
    ) -> Result<StartResult> {
        self.configured(network_type)?;
        let request = FeatureRequest {
            network_type,
            feature: feature.to_string(),
            pid,
            uid,
        };
        let outcome = self.shared.features.start(
            &request,
            &self.shared.table,
            &self.shared.trackers,
            &self.shared.policy,
        );
        if let Some((user_id, delay)) = outcome.expire {
            self.post_delayed(Message::RestoreDefaultNetwork { user_id }, delay)?;
        }
        if let Some(used) = outcome.refresh_dns {
            self.post(Message::DnsConfigurationChange(used))?;
        }
        debug!(
            "start_using_network_feature({}, {}) by pid {} -> {:?}",
            network_type, feature, pid, outcome.result
        );
        Ok(outcome.result)
    }

    pub fn stop_using_network_feature(
        &self,
        network_type: NetworkType,
        feature: &str,
        pid: u32,
        uid: u32,
    ) -> Result<StopResult> {
        self.configured(network_type)?;
        let request = FeatureRequest {
            network_type,
            feature: feature.to_string(),
            pid,
            uid,
        };
        Ok(self.shared.features.stop(&request, &self.shared.trackers))
    }

    /// Blocks until the worker answers. Async callers must run this on a
    /// blocking thread.
    pub fn request_route_to_host_address(
        &self,
        network_type: NetworkType,
        address: IpAddr,
        pid: u32,
    ) -> Result<bool> {
        if !self.is_network_supported(network_type) {
            debug!("Route to {} requested over unsupported {}", address, network_type);
            return Ok(false);
        }
        let (reply, rx) = oneshot::channel();
        self.post(Message::RequestRouteToHost {
            network_type,
            address,
            pid,
            reply: Some(reply),
        })?;
        rx.blocking_recv().map_err(|_| CoreError::ServiceStopped)
    }

    pub fn mobile_data_enabled(&self) -> bool {
        self.snapshot().mobile_data_enabled
    }

    pub fn set_mobile_data_enabled(&self, enabled: bool) -> Result<()> {
        self.post(Message::SetMobileData(enabled))
    }

    pub fn set_policy_data_enable(&self, network_type: NetworkType, enabled: bool) -> Result<()> {
        self.configured(network_type)?;
        self.post(Message::SetPolicyDataEnable {
            network_type,
            enabled,
        })
    }

    pub fn report_inet_condition(&self, network_type: NetworkType, percentage: u8) -> Result<()> {
        self.configured(network_type)?;
        if percentage > 100 {
            return Err(CoreError::invalid_argument(
                "percentage",
                percentage.to_string(),
                "must be 0..=100",
            ));
        }
        self.post(Message::InetConditionChange {
            network_type,
            condition: percentage,
        })
    }

    pub fn set_data_dependency(&self, network_type: NetworkType, met: bool) -> Result<()> {
        self.configured(network_type)?;
        self.post(Message::SetDependencyMet { network_type, met })
    }

    /// Holds the transition wakelock until the next default network connects
    /// or the timeout passes. Returns false when a hold already exists.
    pub fn request_network_transition_wakelock(&self, for_what: &str) -> Result<bool> {
        let Some(serial) = self.shared.wakelock.acquire(for_what) else {
            return Ok(false);
        };
        self.post_delayed(
            Message::ClearTransitionWakelock { serial },
            self.shared.config.wakelock_timeout(),
        )?;
        Ok(true)
    }

    pub fn wakelock_status(&self) -> WakelockStatus {
        self.shared.wakelock.status()
    }

    /// True when every tracker accepted the change.
    pub fn set_radios(&self, on: bool) -> bool {
        let mut all_ok = true;
        for (network_type, tracker) in self.shared.trackers.iter() {
            if !tracker.set_radio(on) {
                warn!("{} refused radio {}", network_type, if on { "on" } else { "off" });
                all_ok = false;
            }
        }
        all_ok
    }

    pub fn set_radio(&self, network_type: NetworkType, on: bool) -> Result<bool> {
        self.configured(network_type)?;
        Ok(self
            .shared
            .trackers
            .get(network_type)
            .is_some_and(|t| t.set_radio(on)))
    }

    pub fn set_global_proxy(&self, proxy: Option<ProxyInfo>) -> Result<()> {
        self.post(Message::SetGlobalProxy(proxy))
    }

    pub fn global_proxy(&self) -> Option<ProxyInfo> {
        self.shared.proxy.global()
    }

    /// Proxy in effect: the global one, else the active network's.
    pub fn proxy(&self) -> Option<ProxyInfo> {
        self.shared.proxy.effective()
    }

    pub fn set_uid_rule(&self, uid: u32, rule: UidRule) {
        if self.shared.policy.set_rule(uid, rule) {
            self.shared.persist(|s| {
                if rule == UidRule::Allow {
                    s.uid_rules.remove(&uid);
                } else {
                    s.uid_rules.insert(uid, rule);
                }
            });
        }
    }

    pub fn uid_rule(&self, uid: u32) -> UidRule {
        self.shared.policy.rule(uid)
    }

    pub fn start_fmc(&self) -> Result<()> {
        self.post(Message::StartFmc)
    }

    pub fn stop_fmc(&self) -> Result<()> {
        self.post(Message::StopFmc)
    }

    pub fn fmc_status(&self) -> FmcStatus {
        self.snapshot().fmc_status
    }

    pub fn switch_connectivity(&self, network_type: NetworkType) -> Result<()> {
        self.configured(network_type)?;
        self.post(Message::SwitchConnectivity(network_type))
    }

    pub fn reprioritize_dns(&self, network_type: NetworkType) -> Result<()> {
        self.configured(network_type)?;
        self.post(Message::ReprioritizeDns(network_type))
    }

    pub fn process_died(&self, pid: u32) -> Result<()> {
        self.post(Message::ProcessDied(pid))
    }

    pub fn override_dns(&self, dns: DnsOverride) -> Result<()> {
        self.post(Message::OverrideDns(dns))
    }

    pub fn restore_dns(&self) -> Result<()> {
        self.post(Message::RestoreDns)
    }

    pub fn reload_settings(&self) -> Result<()> {
        self.post(Message::ReloadSettings)
    }

    pub fn dns(&self) -> DnsSnapshot {
        self.shared.dns.snapshot()
    }

    pub fn feature_users(&self) -> Vec<FeatureUser> {
        self.shared.features.users()
    }

    /// Pids that currently hold a feature or a host route.
    pub fn live_requester_pids(&self) -> Vec<u32> {
        self.shared.features.live_pids()
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl EventSink for ServiceHandle {
    fn post(&self, event: TrackerEvent) {
        let network_type = event.info().network_type;
        if self.tx.send(Envelope::Post(Message::Tracker(event))).is_err() {
            debug!("Dropping {} event, service stopped", network_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::tests::RecordingBroadcasts;
    use crate::link::{LinkAddress, RouteInfo};
    use crate::netd::tests::MockNetd;
    use crate::tracker::tests::MockTracker;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn wifi_link() -> LinkProperties {
        let mut lp = LinkProperties::new("wlan0");
        lp.add_address(LinkAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 24));
        lp.add_route(RouteInfo::default_via(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            None,
        ));
        lp.add_dns(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        lp
    }

    fn config() -> CoreConfig {
        CoreConfig {
            networks: vec![
                "wifi,1,1,1,-1,true".to_string(),
                "mobile,0,0,0,-1,true".to_string(),
            ],
            radios: vec!["1,1".to_string(), "0,1".to_string()],
            ..CoreConfig::default()
        }
    }

    #[test]
    fn service_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let wifi = MockTracker::new(NetworkType::WIFI);
        let mobile = MockTracker::new(NetworkType::MOBILE);
        let netd = MockNetd::new();
        let broadcasts = RecordingBroadcasts::new();

        let service = ConnectivityService::start(ServiceParts {
            config: config(),
            trackers: vec![
                (NetworkType::WIFI, Arc::new(wifi.clone()) as Arc<dyn NetworkStateTracker>),
                (NetworkType::MOBILE, Arc::new(mobile.clone()) as Arc<dyn NetworkStateTracker>),
            ],
            netd: Arc::new(netd.clone()),
            broadcasts: Arc::new(broadcasts.clone()),
            settings: Some(SettingsStore::new(temp_dir.path())),
        })
        .unwrap();
        let handle = service.handle();
        assert_eq!(mobile.user_data_enabled(), Some(true));

        EventSink::post(&handle, wifi.connect(wifi_link()));
        // The worker answers in order, so the connect is processed by now.
        let routed = handle
            .request_route_to_host_address(
                NetworkType::WIFI,
                IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
                4242,
            )
            .unwrap();
        assert!(routed);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.active_default, Some(NetworkType::WIFI));
        assert_eq!(
            handle.active_link_properties().and_then(|lp| lp.interface_name),
            Some("wlan0".to_string())
        );
        assert_eq!(handle.dns().servers, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))]);
        assert!(handle.live_requester_pids().contains(&4242));
        assert!(!netd.main_routes_on("wlan0").is_empty());

        handle.set_network_preference(NetworkType::MOBILE).unwrap();
        service.shutdown();

        let stored = SettingsStore::new(temp_dir.path()).load().unwrap();
        assert_eq!(stored.network_preference, Some(NetworkType::MOBILE));
        assert!(matches!(
            handle.set_mobile_data_enabled(false),
            Err(CoreError::ServiceStopped)
        ));
    }

    #[test]
    fn rejects_unconfigured_types() {
        let service = ConnectivityService::start(ServiceParts {
            config: config(),
            trackers: Vec::new(),
            netd: Arc::new(MockNetd::new()),
            broadcasts: Arc::new(RecordingBroadcasts::new()),
            settings: None,
        })
        .unwrap();
        let handle = service.handle();
        assert!(matches!(
            handle.network_info(NetworkType::ETHERNET, 0),
            Err(CoreError::NetworkNotConfigured(NetworkType::ETHERNET))
        ));
        assert!(handle.set_network_preference(NetworkType::BLUETOOTH).is_err());
        assert!(!handle.is_network_supported(NetworkType::WIFI));
        assert_eq!(
            handle
                .request_route_to_host_address(
                    NetworkType::WIFI,
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    1
                )
                .unwrap(),
            false
        );
    }
}
