//! End-to-end runs of the state machine against recording collaborators and
//! a manual clock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::broadcast::tests::RecordingBroadcasts;
use crate::broadcast::{Broadcast, Delivery};
use crate::clock::{Clock, ManualClock};
use crate::config::{CoreConfig, Variant};
use crate::connectivity::{Connectivity, Shared, Snapshot};
use crate::hsm::fmc::FmcStatus;
use crate::hsm::message::Message;
use crate::hsm::{StateId, StateMachine};
use crate::link::{LinkAddress, LinkProperties, RouteInfo};
use crate::netd::tests::{MockNetd, NetdCall};
use crate::settings::Settings;
use crate::tracker::tests::MockTracker;
use crate::tracker::{NetworkStateTracker, TrackerEvent};
use crate::types::NetworkType;

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

/// A link with one address, its subnet route, a default route through
/// `gateway` and one resolver.
fn link(iface: &str, address: IpAddr, gateway: IpAddr, dns: IpAddr) -> LinkProperties {
    let mut lp = LinkProperties::new(iface);
    lp.add_address(LinkAddress::new(address, 24));
    let subnet: IpNet = IpNet::new(address, 24).unwrap();
    lp.add_route(RouteInfo::new(subnet, None, None));
    lp.add_route(RouteInfo::default_via(gateway, None));
    lp.add_dns(dns);
    lp
}

fn wifi_link() -> LinkProperties {
    link("wlan0", v4(192, 168, 1, 20), v4(192, 168, 1, 1), v4(192, 168, 1, 1))
}

fn mobile_link() -> LinkProperties {
    link("rmnet0", v4(10, 64, 0, 7), v4(10, 64, 0, 1), v4(10, 64, 0, 53))
}

fn ethernet_link() -> LinkProperties {
    link("eth0", v4(172, 16, 0, 9), v4(172, 16, 0, 1), v4(172, 16, 0, 53))
}

struct Harness {
    machine: StateMachine,
    clock: Arc<ManualClock>,
    netd: MockNetd,
    broadcasts: RecordingBroadcasts,
    trackers: HashMap<NetworkType, MockTracker>,
}

impl Harness {
    fn new(config: CoreConfig, types: &[NetworkType]) -> Self {
        let netd = MockNetd::new();
        let broadcasts = RecordingBroadcasts::new();
        let clock = Arc::new(ManualClock::new());
        let trackers: HashMap<NetworkType, MockTracker> = types
            .iter()
            .map(|t| (*t, MockTracker::new(*t)))
            .collect();
        let settings = Settings::default();
        let shared = Arc::new(Shared::new(
            config,
            trackers
                .iter()
                .map(|(t, m)| (*t, Arc::new(m.clone()) as Arc<dyn NetworkStateTracker>))
                .collect(),
            Arc::new(netd.clone()),
            Arc::new(broadcasts.clone()),
            None,
            &settings,
        ));
        let ctx = Connectivity::new(shared, &settings);
        let machine = StateMachine::new(ctx, clock.clone() as Arc<dyn Clock>);
        Self {
            machine,
            clock,
            netd,
            broadcasts,
            trackers,
        }
    }

    fn tracker(&self, network_type: NetworkType) -> &MockTracker {
        &self.trackers[&network_type]
    }

    fn deliver(&mut self, event: TrackerEvent) {
        self.machine.post(Message::Tracker(event));
        self.machine.process_due();
    }

    fn send(&mut self, msg: Message) {
        self.machine.post(msg);
        self.machine.process_due();
    }

    fn connect(&mut self, network_type: NetworkType, lp: LinkProperties) {
        let event = self.tracker(network_type).connect(lp);
        self.deliver(event);
    }

    fn disconnect(&mut self, network_type: NetworkType) {
        let event = self.tracker(network_type).disconnect();
        self.deliver(event);
    }

    fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.machine.process_due();
    }

    fn snapshot(&self) -> Snapshot {
        self.machine.ctx().shared.snapshot()
    }

    fn default_route_metric(&self, iface: &str) -> Option<Option<u32>> {
        self.netd
            .main_routes_on(iface)
            .into_iter()
            .find(|r| r.route.is_default_route())
            .map(|r| r.metric)
    }
}

fn networks(entries: &[&str], radios: &[&str]) -> CoreConfig {
    CoreConfig {
        networks: entries.iter().map(|s| s.to_string()).collect(),
        radios: radios.iter().map(|s| s.to_string()).collect(),
        ..CoreConfig::default()
    }
}

fn wifi_mobile(variant: Variant) -> CoreConfig {
    CoreConfig {
        variant,
        ..networks(
            &["wifi,1,1,1,-1,true", "mobile,0,0,2,-1,true"],
            &["1,1", "0,1"],
        )
    }
}

const BOTH: [NetworkType; 2] = [NetworkType::WIFI, NetworkType::MOBILE];

#[test]
fn preferred_network_replaces_the_default() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::MOBILE));
    assert!(h.default_route_metric("rmnet0").is_some());

    h.connect(NetworkType::WIFI, wifi_link());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);

    h.disconnect(NetworkType::MOBILE);
    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
    assert_eq!(h.netd.default_dns_interface(), Some("wlan0".to_string()));
}

#[test]
fn worse_newcomer_is_torn_down_and_never_routed() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    h.connect(NetworkType::MOBILE, mobile_link());

    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);
    assert_eq!(h.tracker(NetworkType::WIFI).teardown_calls(), 0);
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
}

#[test]
fn failed_teardown_keeps_the_current_default() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::MOBILE, mobile_link());
    h.tracker(NetworkType::MOBILE).set_teardown_result(false);

    h.connect(NetworkType::WIFI, wifi_link());

    assert_eq!(h.snapshot().active_default, Some(NetworkType::MOBILE));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);
    assert_eq!(h.tracker(NetworkType::WIFI).teardown_calls(), 1);
    assert!(h.netd.main_routes_on("wlan0").is_empty());
    assert!(h.default_route_metric("rmnet0").is_some());
}

#[test]
fn accepted_network_applies_its_tcp_buffer_sizes() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.tracker(NetworkType::WIFI)
        .set_tcp_buffers("4096,87380,524288,4096,16384,262144");

    h.connect(NetworkType::WIFI, wifi_link());

    assert!(h.netd.calls().contains(&NetdCall::SetTcpBufferSizes(
        "4096,87380,524288,4096,16384,262144".to_string()
    )));
}

#[test]
fn failover_and_recovery_between_two_networks() {
    // Neither type is the preference, so priority alone decides.
    let config = networks(
        &["mobile,0,0,10,-1,true", "ethernet,9,9,5,-1,true"],
        &["0,1", "9,1"],
    );
    let mut h = Harness::new(config, &[NetworkType::MOBILE, NetworkType::ETHERNET]);

    h.connect(NetworkType::ETHERNET, ethernet_link());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::ETHERNET));

    h.disconnect(NetworkType::ETHERNET);
    assert_eq!(h.snapshot().active_default, None);
    assert_eq!(h.tracker(NetworkType::MOBILE).reconnect_calls(), 1);
    assert!(h.machine.ctx().shared.wakelock.status().held);
    let lost = h.broadcasts.connectivity();
    let (change, delivery) = lost.last().unwrap();
    assert_eq!(*delivery, Delivery::Immediate);
    assert!(change.no_connectivity);
    assert!(h.netd.main_routes_on("eth0").is_empty());

    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::MOBILE));
    assert!(h
        .broadcasts
        .connectivity()
        .iter()
        .any(|(c, _)| c.info.network_type == NetworkType::MOBILE && c.is_failover));
    h.advance(Duration::from_secs(1));
    assert!(!h.machine.ctx().shared.wakelock.status().held);

    h.connect(NetworkType::ETHERNET, ethernet_link());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::ETHERNET));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);
    h.disconnect(NetworkType::MOBILE);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::ETHERNET));
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
    assert!(!h.netd.main_routes_on("eth0").is_empty());
    let eth_dns = vec![v4(172, 16, 0, 53)];
    assert_eq!(h.netd.dns_for("eth0"), eth_dns);
    assert_eq!(h.machine.ctx().shared.dns.snapshot().servers, eth_dns);
    assert_eq!(h.netd.default_dns_interface(), Some("eth0".to_string()));
}

#[test]
fn host_routes_are_released_with_their_network() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    h.send(Message::RequestRouteToHost {
        network_type: NetworkType::WIFI,
        address: v4(10, 20, 30, 40),
        pid: 77,
        reply: None,
    });
    let host = RouteInfo::make_host_route(v4(10, 20, 30, 40), Some(v4(192, 168, 1, 1)), Some("wlan0"));
    assert!(h.netd.main_routes().iter().any(|r| r.route == host));
    assert!(h.machine.ctx().shared.features.live_pids().contains(&77));

    h.disconnect(NetworkType::WIFI);
    assert!(h.netd.main_routes_on("wlan0").is_empty());
    assert!(h.snapshot().installed_routes.is_empty());
}

#[test]
fn dead_requester_releases_its_host_routes() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    for (pid, address) in [(77, v4(10, 20, 30, 40)), (78, v4(10, 20, 30, 41))] {
        h.send(Message::RequestRouteToHost {
            network_type: NetworkType::WIFI,
            address,
            pid,
            reply: None,
        });
    }
    let gone = RouteInfo::make_host_route(v4(10, 20, 30, 40), Some(v4(192, 168, 1, 1)), Some("wlan0"));
    let kept = RouteInfo::make_host_route(v4(10, 20, 30, 41), Some(v4(192, 168, 1, 1)), Some("wlan0"));

    h.send(Message::ProcessDied(77));

    let features = &h.machine.ctx().shared.features;
    assert_eq!(features.live_pids(), vec![78]);
    assert!(!h.netd.main_routes().iter().any(|r| r.route == gone));
    assert!(h.netd.main_routes().iter().any(|r| r.route == kept));
    assert!(h.default_route_metric("wlan0").is_some());
    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
}

#[test]
fn route_request_needs_a_connected_network() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    h.send(Message::RequestRouteToHost {
        network_type: NetworkType::MOBILE,
        address: v4(10, 20, 30, 40),
        pid: 77,
        reply: Some(tx),
    });
    assert_eq!(rx.try_recv().unwrap(), false);
    assert!(h.netd.calls().is_empty());
}

#[test]
fn deferred_message_is_not_lost_across_a_transition() {
    let mut h = Harness::new(wifi_mobile(Variant::Smart), &BOTH);
    assert_eq!(h.machine.current(), StateId::Smart);
    h.connect(NetworkType::WIFI, wifi_link());

    let event = h.tracker(NetworkType::MOBILE).connect(mobile_link());
    h.machine.post(Message::Tracker(event));
    h.machine.post(Message::SetMobileData(false));
    h.machine.process_due();

    assert_eq!(h.machine.current(), StateId::WifiDefault);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::WIFI));
    assert_eq!(
        snapshot.connected_defaults,
        vec![NetworkType::WIFI, NetworkType::MOBILE]
    );
    // The connect was redelivered and handled before the queued command.
    assert_eq!(h.default_route_metric("rmnet0"), Some(Some(10)));
    assert_eq!(h.default_route_metric("wlan0"), Some(Some(0)));
    assert_eq!(h.tracker(NetworkType::MOBILE).user_data_enabled(), Some(false));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 0);
    assert_eq!(
        h.machine.ctx().shared.dns.snapshot().servers,
        vec![v4(192, 168, 1, 1), v4(10, 64, 0, 53)]
    );
    // Handled exactly once.
    assert_eq!(mobile_connected_notices(&h), 1);
    assert_eq!(default_route_adds(&h, "rmnet0"), 1);

    h.disconnect(NetworkType::MOBILE);
    assert_eq!(h.machine.current(), StateId::WifiDefault);
    assert_eq!(h.snapshot().connected_defaults, vec![NetworkType::WIFI]);
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
    assert_eq!(h.default_route_metric("wlan0"), Some(Some(0)));
    assert_eq!(mobile_connected_notices(&h), 1);
    assert_eq!(default_route_adds(&h, "rmnet0"), 1);
}

fn mobile_connected_notices(h: &Harness) -> usize {
    h.broadcasts
        .connectivity()
        .iter()
        .filter(|(change, delivery)| {
            *delivery == Delivery::Immediate
                && change.info.network_type == NetworkType::MOBILE
                && change.info.is_connected()
        })
        .count()
}

fn default_route_adds(h: &Harness, iface: &str) -> usize {
    h.netd
        .calls()
        .iter()
        .filter(|call| {
            matches!(call, NetdCall::AddRoute { iface: i, route, .. }
                if i == iface && route.is_default_route())
        })
        .count()
}

fn dual_wifi_default() -> Harness {
    let mut h = Harness::new(wifi_mobile(Variant::Smart), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.machine.current(), StateId::WifiDefault);
    h
}

#[test]
fn losing_the_preferred_network_promotes_the_other() {
    let mut h = dual_wifi_default();
    h.disconnect(NetworkType::WIFI);

    assert_eq!(h.machine.current(), StateId::Smart);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::MOBILE));
    assert_eq!(snapshot.connected_defaults, vec![NetworkType::MOBILE]);
    assert!(snapshot.dual.is_none());
    assert!(h.netd.main_routes_on("wlan0").is_empty());
    assert_eq!(h.default_route_metric("rmnet0"), Some(Some(0)));
    assert_eq!(h.netd.default_dns_interface(), Some("rmnet0".to_string()));
    assert_eq!(h.tracker(NetworkType::MOBILE).reconnect_calls(), 0);
}

#[test]
fn losing_the_other_network_keeps_the_dual_state() {
    let mut h = dual_wifi_default();
    h.disconnect(NetworkType::MOBILE);

    assert_eq!(h.machine.current(), StateId::WifiDefault);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::WIFI));
    assert_eq!(snapshot.connected_defaults, vec![NetworkType::WIFI]);
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
    assert_eq!(
        h.machine.ctx().shared.dns.snapshot().servers,
        vec![v4(192, 168, 1, 1)]
    );

    // The partner may come back without leaving the state.
    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.machine.current(), StateId::WifiDefault);
    assert_eq!(h.default_route_metric("rmnet0"), Some(Some(10)));
}

#[test]
fn switching_connectivity_flips_the_preferred_member() {
    let mut h = dual_wifi_default();
    h.send(Message::SwitchConnectivity(NetworkType::MOBILE));

    assert_eq!(h.machine.current(), StateId::MobileDefault);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::MOBILE));
    assert_eq!(h.default_route_metric("rmnet0"), Some(Some(0)));
    assert_eq!(h.default_route_metric("wlan0"), Some(Some(10)));
    assert_eq!(
        h.machine.ctx().shared.dns.snapshot().servers,
        vec![v4(10, 64, 0, 53), v4(192, 168, 1, 1)]
    );
}

#[test]
fn reprioritized_dns_lists_the_chosen_network_first() {
    let mut h = dual_wifi_default();
    h.send(Message::ReprioritizeDns(NetworkType::MOBILE));
    assert_eq!(
        h.machine.ctx().shared.dns.snapshot().servers,
        vec![v4(10, 64, 0, 53), v4(192, 168, 1, 1)]
    );
    assert_eq!(h.snapshot().dual.map(|d| d.dns_first), Some(NetworkType::MOBILE));
    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
}

#[test]
fn better_third_network_ends_dual_mode() {
    let config = CoreConfig {
        variant: Variant::Smart,
        default_network_preference: NetworkType::ETHERNET,
        ..networks(
            &[
                "wifi,1,1,1,-1,true",
                "mobile,0,0,2,-1,true",
                "ethernet,9,9,0,-1,true",
            ],
            &["1,1", "0,1", "9,1"],
        )
    };
    let mut h = Harness::new(
        config,
        &[NetworkType::WIFI, NetworkType::MOBILE, NetworkType::ETHERNET],
    );
    h.connect(NetworkType::WIFI, wifi_link());
    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.machine.current(), StateId::WifiDefault);

    h.connect(NetworkType::ETHERNET, ethernet_link());
    assert_eq!(h.machine.current(), StateId::Smart);
    assert_eq!(h.snapshot().active_default, Some(NetworkType::ETHERNET));
    assert_eq!(h.tracker(NetworkType::WIFI).teardown_calls(), 1);
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);
}

#[test]
fn worse_third_network_joins_below_the_dual_defaults() {
    let config = CoreConfig {
        variant: Variant::Smart,
        ..networks(
            &[
                "wifi,1,1,1,-1,true",
                "mobile,0,0,2,-1,true",
                "ethernet,9,9,5,-1,true",
            ],
            &["1,1", "0,1", "9,1"],
        )
    };
    let mut h = Harness::new(
        config,
        &[NetworkType::WIFI, NetworkType::MOBILE, NetworkType::ETHERNET],
    );
    h.connect(NetworkType::WIFI, wifi_link());
    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.machine.current(), StateId::WifiDefault);

    h.connect(NetworkType::ETHERNET, ethernet_link());

    assert_eq!(h.machine.current(), StateId::WifiDefault);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.active_default, Some(NetworkType::WIFI));
    assert_eq!(
        snapshot.connected_defaults,
        vec![NetworkType::WIFI, NetworkType::MOBILE]
    );
    for network_type in [NetworkType::WIFI, NetworkType::MOBILE, NetworkType::ETHERNET] {
        assert_eq!(h.tracker(network_type).teardown_calls(), 0);
    }
    assert_eq!(h.default_route_metric("eth0"), Some(Some(11)));
    assert_eq!(h.default_route_metric("wlan0"), Some(Some(0)));
    assert_eq!(h.default_route_metric("rmnet0"), Some(Some(10)));
}

#[test]
fn fmc_moves_the_default_to_mobile_and_back() {
    let mut h = Harness::new(wifi_mobile(Variant::Fmc), &BOTH);
    assert_eq!(h.machine.current(), StateId::FmcInitial);
    h.connect(NetworkType::WIFI, wifi_link());
    h.send(Message::StartFmc);
    assert_eq!(h.snapshot().fmc_status, FmcStatus::Enabled);

    h.connect(NetworkType::MOBILE, mobile_link());
    assert_eq!(h.machine.current(), StateId::FmcActive);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.fmc_status, FmcStatus::Active);
    assert_eq!(snapshot.active_default, Some(NetworkType::MOBILE));
    assert_eq!(h.tracker(NetworkType::WIFI).teardown_calls(), 0);
    assert_eq!(h.default_route_metric("wlan0"), None);
    assert!(!h.netd.main_routes_on("wlan0").is_empty());
    assert!(h.default_route_metric("rmnet0").is_some());

    h.disconnect(NetworkType::MOBILE);
    assert_eq!(h.machine.current(), StateId::FmcInitial);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.fmc_status, FmcStatus::Enabled);
    assert_eq!(snapshot.active_default, Some(NetworkType::WIFI));
    assert!(h.default_route_metric("wlan0").is_some());
    assert!(h.netd.main_routes_on("rmnet0").is_empty());
    assert_eq!(h.netd.default_dns_interface(), Some("wlan0".to_string()));
}

#[test]
fn stopping_fmc_tears_mobile_down() {
    let mut h = Harness::new(wifi_mobile(Variant::Fmc), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    h.send(Message::StartFmc);
    h.connect(NetworkType::MOBILE, mobile_link());

    h.send(Message::StopFmc);
    assert_eq!(h.machine.current(), StateId::FmcInitial);
    assert_eq!(h.snapshot().fmc_status, FmcStatus::Disabled);
    assert_eq!(h.snapshot().active_default, Some(NetworkType::WIFI));
    assert_eq!(h.tracker(NetworkType::MOBILE).teardown_calls(), 1);
    assert!(h.default_route_metric("wlan0").is_some());
}

#[test]
fn inet_condition_is_debounced_through_the_queue() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    for condition in [30, 80, 40] {
        h.machine.post(Message::InetConditionChange {
            network_type: NetworkType::WIFI,
            condition,
        });
    }
    h.machine.process_due();

    h.advance(Duration::from_millis(2999));
    assert!(h.broadcasts.inet_conditions().is_empty());
    h.advance(Duration::from_millis(1));
    assert_eq!(h.broadcasts.inet_conditions(), vec![(NetworkType::WIFI, 40)]);
    assert_eq!(h.snapshot().inet.primary.published, 40);
}

#[test]
fn delayed_connectivity_broadcast_follows_the_immediate_one() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    let deliveries: Vec<Delivery> = h.broadcasts.connectivity().into_iter().map(|(_, d)| d).collect();
    assert_eq!(deliveries, vec![Delivery::Immediate]);

    h.advance(h.machine.ctx().shared.config.connectivity_change_delay());
    let deliveries: Vec<Delivery> = h.broadcasts.connectivity().into_iter().map(|(_, d)| d).collect();
    assert_eq!(deliveries, vec![Delivery::Immediate, Delivery::Delayed]);
    assert!(h.broadcasts.sent().iter().any(|b| matches!(
        b,
        Broadcast::InterfaceType { interface, network_type }
            if interface == "wlan0" && *network_type == NetworkType::WIFI
    )));
}

#[test]
fn preference_change_tears_down_the_current_default() {
    let mut h = Harness::new(wifi_mobile(Variant::Single), &BOTH);
    h.connect(NetworkType::WIFI, wifi_link());
    h.send(Message::SetNetworkPreference(NetworkType::MOBILE));

    assert_eq!(h.snapshot().network_preference, NetworkType::MOBILE);
    assert_eq!(h.tracker(NetworkType::WIFI).teardown_calls(), 1);
}
