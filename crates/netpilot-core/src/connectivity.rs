//! State owned by the connectivity worker and the helpers every state
//! handler shares.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcast, BroadcastSink, ConnectivityChange, Delivery};
use crate::config::{CoreConfig, NetworkTable};
use crate::dns::DnsState;
use crate::features::FeatureTracker;
use crate::hsm::dual::DualPair;
use crate::hsm::fmc::FmcStatus;
use crate::hsm::message::Message;
use crate::hsm::smart::ConnectedDefaultNetworkSet;
use crate::hsm::StateId;
use crate::inet::{InetDomain, InetDomains};
use crate::link::{LinkProperties, RouteInfo};
use crate::netd::{Netd, ResetMask};
use crate::policy::UidPolicy;
use crate::proxy::{ProxyInfo, ProxyState};
use crate::reconcile::{reset_mask, Reconciler};
use crate::registry::Registry;
use crate::settings::{Settings, SettingsStore};
use crate::tracker::{NetworkStateTracker, TrackerSet};
use crate::types::{DetailedState, NetworkInfo, NetworkType};
use crate::wakelock::TransitionWakelock;

/// State reachable from API caller threads as well as the worker.
pub struct Shared {
    pub(crate) config: CoreConfig,
    pub(crate) table: NetworkTable,
    pub(crate) trackers: TrackerSet,
    pub(crate) features: FeatureTracker,
    pub(crate) policy: UidPolicy,
    pub(crate) proxy: ProxyState,
    pub(crate) wakelock: TransitionWakelock,
    pub(crate) dns: DnsState,
    pub(crate) settings: Option<SettingsStore>,
    pub(crate) netd: Arc<dyn Netd>,
    pub(crate) broadcasts: Arc<dyn BroadcastSink>,
    pub(crate) snapshot: RwLock<Snapshot>,
}

impl Shared {
    pub fn new(
        config: CoreConfig,
        trackers: Vec<(NetworkType, Arc<dyn NetworkStateTracker>)>,
        netd: Arc<dyn Netd>,
        broadcasts: Arc<dyn BroadcastSink>,
        settings_store: Option<SettingsStore>,
        settings: &Settings,
    ) -> Self {
        let table = config.network_table();
        let trackers = TrackerSet::new(&table, trackers);
        let dns = DnsState::new(config.default_dns_server);
        Self {
            table,
            trackers,
            features: FeatureTracker::new(),
            policy: UidPolicy::new(settings.uid_rules.clone()),
            proxy: ProxyState::new(settings.global_proxy.clone()),
            wakelock: TransitionWakelock::new(),
            dns,
            settings: settings_store,
            netd,
            broadcasts,
            snapshot: RwLock::new(Snapshot::default()),
            config,
        }
    }

    /// Applies `change` to the stored settings. Persistence failures are
    /// logged; the in-memory state still changes.
    pub(crate) fn persist(&self, change: impl FnOnce(&mut Settings)) {
        if let Some(store) = &self.settings {
            if let Err(err) = store.update(change) {
                warn!("Failed to persist settings: {:#}", err);
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn table(&self) -> &NetworkTable {
        &self.table
    }

    pub fn trackers(&self) -> &TrackerSet {
        &self.trackers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub network_type: NetworkType,
    pub link: LinkProperties,
}

/// Point-in-time view of the worker's state, published after every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: StateId,
    pub active_default: Option<NetworkType>,
    pub network_preference: NetworkType,
    pub mobile_data_enabled: bool,
    pub links: Vec<LinkEntry>,
    pub connected_defaults: Vec<NetworkType>,
    pub dual: Option<DualPair>,
    pub fmc_status: FmcStatus,
    pub inet: InetDomains,
    pub installed_routes: Vec<RouteInfo>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: StateId::Default,
            active_default: None,
            network_preference: NetworkType::WIFI,
            mobile_data_enabled: true,
            links: Vec::new(),
            connected_defaults: Vec::new(),
            dual: None,
            fmc_status: FmcStatus::Disabled,
            inet: InetDomains::default(),
            installed_routes: Vec::new(),
        }
    }
}

impl Snapshot {
    pub fn link(&self, network_type: NetworkType) -> Option<&LinkProperties> {
        self.links
            .iter()
            .find(|entry| entry.network_type == network_type)
            .map(|entry| &entry.link)
    }
}

pub struct Connectivity {
    pub(crate) shared: Arc<Shared>,
    pub(crate) registry: Registry,
    pub(crate) reconciler: Reconciler,
    pub(crate) inet: InetDomains,
    pub(crate) active_default: Option<NetworkType>,
    pub(crate) network_preference: NetworkType,
    pub(crate) mobile_data_enabled: bool,
    pub(crate) connected_defaults: ConnectedDefaultNetworkSet,
    pub(crate) dual: Option<DualPair>,
    pub(crate) fmc: FmcStatus,
    pending: Vec<(Message, Duration)>,
}

impl Connectivity {
    pub fn new(shared: Arc<Shared>, settings: &Settings) -> Self {
        let registry = Registry::new(&shared.table);
        let reconciler = Reconciler::new(shared.netd.clone(), shared.config.route_recursion_cap);
        let network_preference = settings
            .network_preference
            .filter(|t| shared.table.is_default(*t))
            .unwrap_or(shared.config.default_network_preference);
        Self {
            registry,
            reconciler,
            inet: InetDomains::default(),
            active_default: None,
            network_preference,
            mobile_data_enabled: settings.mobile_data_enabled.unwrap_or(true),
            connected_defaults: ConnectedDefaultNetworkSet::new(),
            dual: None,
            fmc: FmcStatus::Disabled,
            pending: Vec::new(),
            shared,
        }
    }

    pub fn post(&mut self, msg: Message) {
        self.pending.push((msg, Duration::ZERO));
    }

    pub fn post_delayed(&mut self, msg: Message, delay: Duration) {
        self.pending.push((msg, delay));
    }

    pub(crate) fn take_pending(&mut self) -> Vec<(Message, Duration)> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn tracker(&self, network_type: NetworkType) -> Option<Arc<dyn NetworkStateTracker>> {
        self.shared.trackers.get(network_type).cloned()
    }

    pub(crate) fn table(&self) -> &NetworkTable {
        &self.shared.table
    }

    pub(crate) fn is_default(&self, network_type: NetworkType) -> bool {
        self.shared.table.is_default(network_type)
    }

    pub(crate) fn priority(&self, network_type: NetworkType) -> i32 {
        self.shared.table.priority(network_type).unwrap_or(i32::MAX)
    }

    pub(crate) fn is_connected(&self, network_type: NetworkType) -> bool {
        self.tracker(network_type)
            .is_some_and(|t| t.network_info().is_connected())
    }

    /// The tracker's link properties while it is connected.
    pub(crate) fn live_lp(&self, network_type: NetworkType) -> Option<LinkProperties> {
        let tracker = self.tracker(network_type)?;
        if !tracker.network_info().is_connected() {
            return None;
        }
        tracker.link_properties()
    }

    pub(crate) fn send(&self, broadcast: Broadcast) {
        self.shared.broadcasts.send(broadcast);
    }

    /// Connectivity change for `info`. The type's pending failover flag is
    /// consumed.
    pub(crate) fn connectivity_change(&mut self, info: &NetworkInfo) -> ConnectivityChange {
        let is_failover = match self.registry.get_mut(info.network_type) {
            Some(row) => std::mem::take(&mut row.failover_pending),
            None => false,
        };
        let mut info = info.clone();
        info.is_failover = is_failover;
        ConnectivityChange {
            info,
            other_network: None,
            no_connectivity: false,
            is_failover,
            inet_condition: self.inet.primary.published,
        }
    }

    pub(crate) fn send_connectivity(&mut self, change: ConnectivityChange, delivery: Delivery) {
        match delivery {
            Delivery::Immediate => self.send(Broadcast::Connectivity { change, delivery }),
            Delivery::Delayed => {
                let delay = self.shared.config.connectivity_change_delay();
                self.post_delayed(
                    Message::SendBroadcast(Broadcast::Connectivity { change, delivery }),
                    delay,
                );
            }
        }
    }

    /// Immediate notice now, the settled one after the change delay.
    pub(crate) fn send_connected_broadcast_delayed(&mut self, info: &NetworkInfo) {
        let change = self.connectivity_change(info);
        self.send_connectivity(change.clone(), Delivery::Immediate);
        self.send_connectivity(change, Delivery::Delayed);
    }

    pub(crate) fn send_connected_broadcast(&mut self, info: &NetworkInfo) {
        let change = self.connectivity_change(info);
        self.send(Broadcast::Connectivity {
            change: change.clone(),
            delivery: Delivery::Immediate,
        });
        self.send(Broadcast::Connectivity {
            change,
            delivery: Delivery::Delayed,
        });
    }

    pub(crate) fn update_network_settings(&self, network_type: NetworkType) {
        let Some(sizes) = self.tracker(network_type).and_then(|t| t.tcp_buffer_sizes()) else {
            return;
        };
        if let Err(err) = self.shared.netd.set_tcp_buffer_sizes(&sizes) {
            warn!("Failed to set tcp buffer sizes for {}: {:#}", network_type, err);
        }
    }

    /// Reconciles routes and DNS of `network_type` against its tracker and
    /// records the result as the current link properties.
    pub(crate) fn handle_connectivity_change(&mut self, network_type: NetworkType, do_reset: bool) {
        let Some(tracker) = self.tracker(network_type) else {
            warn!("Connectivity change for {} without a tracker", network_type);
            return;
        };
        let Some(row) = self.registry.get(network_type) else {
            return;
        };
        let attrs = row.attrs;
        let is_default = row.config.is_default();

        let mut reset = if do_reset {
            ResetMask::ALL
        } else {
            ResetMask::NONE
        };

        self.handle_dns_configuration_change(network_type);

        let cur = self.registry.current_lp(network_type).cloned();
        let new = if tracker.network_info().is_connected() {
            tracker.link_properties()
        } else {
            None
        };
        if let Some(new_lp) = &new {
            reset |= reset_mask(cur.as_ref(), new_lp);
            if is_default && self.active_default == Some(network_type) {
                self.apply_default_proxy(new_lp.http_proxy.clone());
            }
        }

        let routes_changed =
            self.reconciler
                .update_routes(new.as_ref(), cur.as_ref(), is_default, attrs, attrs.metric);
        if new.is_none() {
            self.release_host_routes(network_type, cur.as_ref());
        }
        if let Some(row) = self.registry.get_mut(network_type) {
            row.current_lp = new.clone();
        }

        if reset.is_empty() && !routes_changed {
            return;
        }
        let iface = tracker
            .link_properties()
            .and_then(|lp| lp.interface().map(str::to_string))
            .or_else(|| cur.as_ref().and_then(|lp| lp.interface().map(str::to_string)));
        let Some(iface) = iface else {
            return;
        };
        if !reset.is_empty() {
            info!("Resetting {} connections on {}", reset, iface);
            if let Err(err) = self.shared.netd.reset_connections(&iface, reset) {
                warn!("Failed to reset connections on {}: {:#}", iface, err);
            }
        }
        if routes_changed {
            if let Err(err) = self.shared.netd.flush_interface_dns_cache(&iface) {
                warn!("Failed to flush dns cache on {}: {:#}", iface, err);
            }
        }
    }

    fn release_host_routes(&mut self, network_type: NetworkType, lp: Option<&LinkProperties>) {
        let routes = match self.registry.get_mut(network_type) {
            Some(row) => std::mem::take(&mut row.host_routes),
            None => return,
        };
        let fallback = LinkProperties::default();
        let lp = lp.unwrap_or(&fallback);
        for (_, route) in &routes {
            self.reconciler.remove_host_route(lp, route);
        }
    }

    /// Drops everything `pid` held: its feature requests, its place among
    /// the requesters and the host routes it asked for. Returns how many
    /// feature requests and host routes were released.
    pub(crate) fn process_died(&mut self, pid: u32) -> usize {
        let mut released = self.shared.features.process_died(pid, &self.shared.trackers);
        let types: Vec<NetworkType> = self.registry.iter().map(|row| row.network_type()).collect();
        for network_type in types {
            let Some(row) = self.registry.get_mut(network_type) else {
                continue;
            };
            let (dead, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut row.host_routes)
                .into_iter()
                .partition(|(owner, _)| *owner == pid);
            row.host_routes = kept;
            if dead.is_empty() {
                continue;
            }
            let lp = self.registry.current_lp(network_type).cloned().unwrap_or_default();
            for (_, route) in &dead {
                self.reconciler.remove_host_route(&lp, route);
            }
            released += dead.len();
        }
        released
    }

    pub(crate) fn apply_default_proxy(&self, proxy: Option<ProxyInfo>) {
        if self.shared.proxy.set_default(proxy) {
            self.send(Broadcast::ProxyChange {
                proxy: self.shared.proxy.effective(),
            });
        }
    }

    pub(crate) fn set_global_proxy(&self, proxy: Option<ProxyInfo>) {
        let proxy = proxy.filter(ProxyInfo::is_valid);
        let stored = proxy.clone();
        self.shared.persist(move |s| s.global_proxy = stored);
        if self.shared.proxy.set_global(proxy) {
            self.send(Broadcast::ProxyChange {
                proxy: self.shared.proxy.effective(),
            });
        }
    }

    /// Pushes the DNS servers of a connected network to the resolver. Only
    /// the active default (or the dual pair) owns the default resolver;
    /// other networks get per-interface servers.
    pub(crate) fn handle_dns_configuration_change(&mut self, network_type: NetworkType) {
        let Some(tracker) = self.tracker(network_type) else {
            return;
        };
        if !tracker.network_info().is_connected() || tracker.is_teardown_requested() {
            return;
        }
        let Some(lp) = tracker.link_properties() else {
            return;
        };

        if !self.is_default(network_type) {
            let Some(iface) = lp.interface() else {
                return;
            };
            if let Err(err) = self
                .shared
                .netd
                .set_dns_servers_for_interface(iface, &lp.dns_servers)
            {
                warn!(target: "dns", "Failed to set dns for {}: {:#}", iface, err);
            }
            return;
        }

        if self.shared.dns.is_overridden() {
            debug!(target: "dns", "Dns overridden, not publishing {}", network_type);
            return;
        }
        if let Some(dual) = self.dual.filter(|d| d.contains(network_type)) {
            self.publish_ordered_dns(dual.dns_first, dual.partner(dual.dns_first));
        } else if self.active_default == Some(network_type) {
            if let Some(iface) = lp.interface() {
                self.update_dns(iface, &lp.dns_servers, lp.domains.as_deref());
            }
        } else {
            debug!(target: "dns", "{} is not the default network, dns left alone", network_type);
        }
    }

    /// Publishes `first`'s servers ahead of `second`'s on `first`'s interface.
    pub(crate) fn publish_ordered_dns(&mut self, first: NetworkType, second: Option<NetworkType>) {
        let Some(lp) = self
            .live_lp(first)
            .or_else(|| self.registry.current_lp(first).cloned())
        else {
            return;
        };
        let Some(iface) = lp.interface() else {
            return;
        };
        let mut servers = lp.dns_servers.clone();
        if let Some(second_lp) = second.and_then(|t| self.live_lp(t)) {
            for server in second_lp.dns_servers {
                if !servers.contains(&server) {
                    servers.push(server);
                }
            }
        }
        self.update_dns(iface, &servers, lp.domains.as_deref());
    }

    /// Returns true when the published resolver state changed.
    pub(crate) fn update_dns(&self, iface: &str, servers: &[IpAddr], domains: Option<&str>) -> bool {
        let Some(update) = self.shared.dns.publish(iface, servers, domains) else {
            return false;
        };
        info!(target: "dns", "Dns servers for {}: {:?}", iface, update.servers);
        if let Err(err) = self
            .shared
            .netd
            .set_dns_servers_for_interface(iface, &update.servers)
        {
            warn!(target: "dns", "Failed to set dns servers on {}: {:#}", iface, err);
        }
        if let Err(err) = self.shared.netd.set_default_interface_for_dns(iface) {
            warn!(target: "dns", "Failed to make {} the default dns interface: {:#}", iface, err);
        }
        self.send(Broadcast::DnsChange {
            servers: update.servers,
            counter: update.counter,
        });
        true
    }

    pub(crate) fn inet_report(&mut self, domain: InetDomain, network_type: NetworkType, condition: u8) {
        let up = self.shared.config.debounce_up();
        let down = self.shared.config.debounce_down();
        let Some(hold) = self.inet.get_mut(domain).report(network_type, condition, up, down) else {
            return;
        };
        debug!(
            "Inet condition hold for {} ({:?}) ends in {:?}",
            network_type, domain, hold.delay
        );
        self.post_delayed(
            Message::InetConditionHoldEnd {
                domain,
                sequence: hold.sequence,
            },
            hold.delay,
        );
    }

    pub(crate) fn inet_hold_end(&mut self, domain: InetDomain, sequence: u64) {
        let Some(network_type) = self.inet.get(domain).network else {
            return;
        };
        let Some(tracker) = self.tracker(network_type) else {
            return;
        };
        let info = tracker.network_info();
        let Some(condition) = self
            .inet
            .get_mut(domain)
            .hold_end(sequence, info.is_connected())
        else {
            return;
        };
        info!("Publishing inet condition {} for {}", condition, network_type);
        self.send(Broadcast::InetCondition { info, condition });
    }

    pub(crate) fn request_route_to_host(
        &mut self,
        network_type: NetworkType,
        address: IpAddr,
        pid: u32,
    ) -> bool {
        let Some(tracker) = self.tracker(network_type) else {
            return false;
        };
        let info = tracker.network_info();
        if info.detailed_state != DetailedState::Connected || tracker.is_teardown_requested() {
            debug!(
                "Refusing route to {} over {}: network not ready",
                address, network_type
            );
            return false;
        }
        let Some(lp) = tracker.link_properties() else {
            return false;
        };
        self.shared.features.add_requester(network_type, pid);
        match self.reconciler.add_route_to_address(&lp, address) {
            Some(route) => {
                if let Some(row) = self.registry.get_mut(network_type) {
                    row.host_routes.push((pid, route));
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_network_preference(&mut self, preference: NetworkType, persist: bool) {
        if !self.is_default(preference) {
            warn!("Ignoring preference for non-default network {}", preference);
            return;
        }
        if self.network_preference == preference {
            return;
        }
        info!("Network preference {} -> {}", self.network_preference, preference);
        if persist {
            self.shared
                .persist(|s| s.network_preference = Some(preference));
        }
        self.network_preference = preference;
        self.enforce_preference();
    }

    /// Tears down the other default networks when the preferred one could
    /// connect but has not.
    fn enforce_preference(&mut self) {
        let preference = self.network_preference;
        let Some(preferred) = self.tracker(preference) else {
            return;
        };
        if preferred.network_info().is_connected() || !preferred.is_available() {
            return;
        }
        let others: Vec<NetworkType> = self
            .table()
            .priority_order()
            .iter()
            .copied()
            .filter(|t| *t != preference && self.is_default(*t) && self.is_connected(*t))
            .collect();
        for network_type in others {
            self.teardown(network_type);
        }
    }

    pub(crate) fn set_mobile_data(&mut self, enabled: bool, persist: bool) {
        if persist {
            self.shared.persist(|s| s.mobile_data_enabled = Some(enabled));
        }
        self.mobile_data_enabled = enabled;
        for network_type in [NetworkType::MOBILE, NetworkType::WIMAX] {
            if let Some(tracker) = self.tracker(network_type) {
                tracker.set_user_data_enable(enabled);
            }
        }
    }

    pub(crate) fn reload_settings(&mut self) {
        let Some(store) = &self.shared.settings else {
            return;
        };
        let settings = match store.load() {
            Ok(settings) => settings,
            Err(err) => {
                warn!("Keeping current settings: {:#}", err);
                return;
            }
        };
        info!("Reloading settings from {}", store.path().display());
        if let Some(preference) = settings.network_preference {
            self.set_network_preference(preference, false);
        }
        if let Some(enabled) = settings.mobile_data_enabled {
            if enabled != self.mobile_data_enabled {
                self.set_mobile_data(enabled, false);
            }
        }
        if self.shared.proxy.set_global(settings.global_proxy) {
            self.send(Broadcast::ProxyChange {
                proxy: self.shared.proxy.effective(),
            });
        }
        self.shared.policy.replace_all(settings.uid_rules);
    }

    pub(crate) fn publish_snapshot(&self, state: StateId) {
        let links = self
            .registry
            .iter()
            .filter_map(|row| {
                row.current_lp.as_ref().map(|lp| LinkEntry {
                    network_type: row.network_type(),
                    link: lp.clone(),
                })
            })
            .collect();
        let snapshot = Snapshot {
            state,
            active_default: self.active_default,
            network_preference: self.network_preference,
            mobile_data_enabled: self.mobile_data_enabled,
            links,
            connected_defaults: self.connected_defaults.members().to_vec(),
            dual: self.dual,
            fmc_status: self.fmc,
            inet: self.inet.clone(),
            installed_routes: self
                .reconciler
                .added_routes()
                .routes()
                .map(|(route, _)| route.clone())
                .collect(),
        };
        *self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}
