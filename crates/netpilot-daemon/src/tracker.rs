//! Network-state trackers for plain Linux interfaces.
//!
//! A tracker does not drive the link itself. The interface monitor feeds it
//! what the kernel reports and the tracker turns that into connection states;
//! `teardown` and radio-off hide the interface from the service until
//! `reconnect` or radio-on.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Notify;
use tracing::{debug, info};

use netpilot_core::{
    DetailedState, EventSink, LinkAddress, LinkProperties, NetworkInfo, NetworkStateTracker,
    NetworkType, RouteInfo, TrackerEvent,
};

/// What the kernel currently says about one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub present: bool,
    pub oper_up: bool,
    pub addresses: Vec<LinkAddress>,
    pub gateway: Option<IpAddr>,
}

#[derive(Debug)]
struct Inner {
    info: NetworkInfo,
    link: Option<LinkProperties>,
    teardown_requested: bool,
    suppressed: bool,
    radio_on: bool,
    user_data_enabled: bool,
    policy_data_enabled: bool,
    dependency_met: bool,
    present: bool,
    /// Last gateway seen while the link stayed up.
    gateway: Option<IpAddr>,
}

pub struct InterfaceTracker {
    network_type: NetworkType,
    interface: String,
    dns: Vec<IpAddr>,
    inner: Mutex<Inner>,
    sink: OnceLock<Arc<dyn EventSink>>,
    wake: Arc<Notify>,
}

impl InterfaceTracker {
    pub fn new(
        network_type: NetworkType,
        interface: String,
        dns: Vec<IpAddr>,
        wake: Arc<Notify>,
    ) -> Self {
        let mut info = NetworkInfo::new(network_type);
        info.subtype_name = interface.clone();
        Self {
            network_type,
            interface,
            dns,
            inner: Mutex::new(Inner {
                info,
                link: None,
                teardown_requested: false,
                suppressed: false,
                radio_on: true,
                user_data_enabled: true,
                policy_data_enabled: true,
                dependency_met: true,
                present: false,
                gateway: None,
            }),
            sink: OnceLock::new(),
            wake,
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Events observed before a sink is attached are dropped.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        if self.sink.set(sink).is_err() {
            debug!(target: "net", "{} already has an event sink", self.interface);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Option<TrackerEvent>) {
        if let (Some(event), Some(sink)) = (event, self.sink.get()) {
            sink.post(event);
        }
    }

    fn data_allowed(&self, inner: &Inner) -> bool {
        let user = !self.network_type.is_mobile() || inner.user_data_enabled;
        user && inner.policy_data_enabled && inner.dependency_met
    }

    fn build_link(&self, obs: &Observation, gateway: Option<IpAddr>) -> LinkProperties {
        let mut lp = LinkProperties::new(&self.interface);
        for address in &obs.addresses {
            lp.add_address(*address);
        }
        if let Some(gw) = gateway {
            lp.add_route(RouteInfo::default_via(gw, Some(&self.interface)));
        }
        for server in &self.dns {
            lp.add_dns(*server);
        }
        lp
    }

    /// Applies a fresh observation and reports any resulting transition.
    pub fn observe(&self, obs: Observation) {
        let event = {
            let mut inner = self.lock();
            inner.present = obs.present;
            inner.info.is_available = obs.present && inner.radio_on;
            if !obs.oper_up {
                inner.gateway = None;
            } else if obs.gateway.is_some() {
                inner.gateway = obs.gateway;
            }

            let usable = obs.present
                && obs.oper_up
                && !obs.addresses.is_empty()
                && !inner.suppressed
                && inner.radio_on
                && self.data_allowed(&inner);

            if usable {
                let lp = self.build_link(&obs, inner.gateway);
                if inner.info.is_connected() {
                    if inner.link.as_ref() != Some(&lp) {
                        debug!(target: "net", "{} link properties changed", self.interface);
                        inner.link = Some(lp);
                        Some(TrackerEvent::ConfigurationChanged(inner.info.clone()))
                    } else {
                        None
                    }
                } else {
                    info!(target: "net", "{} ({}) connected", self.interface, self.network_type);
                    inner.link = Some(lp);
                    inner
                        .info
                        .set_detailed_state(DetailedState::Connected, None, None);
                    Some(TrackerEvent::StateChanged(inner.info.clone()))
                }
            } else {
                let reason = if !obs.present {
                    "interface missing"
                } else if !obs.oper_up {
                    "link down"
                } else if obs.addresses.is_empty() {
                    "no address"
                } else if inner.suppressed || !inner.radio_on {
                    "disabled"
                } else {
                    "data disabled"
                };
                self.disconnect_locked(&mut inner, reason)
            }
        };
        self.emit(event);
    }

    fn disconnect_locked(&self, inner: &mut Inner, reason: &str) -> Option<TrackerEvent> {
        if !inner.info.is_connected_or_connecting() {
            if inner.info.detailed_state == DetailedState::Idle {
                inner
                    .info
                    .set_detailed_state(DetailedState::Disconnected, Some(reason.to_string()), None);
            }
            return None;
        }
        info!(target: "net", "{} ({}) disconnected: {}", self.interface, self.network_type, reason);
        inner
            .info
            .set_detailed_state(DetailedState::Disconnected, Some(reason.to_string()), None);
        Some(TrackerEvent::StateChanged(inner.info.clone()))
    }
}

impl NetworkStateTracker for InterfaceTracker {
    fn network_info(&self) -> NetworkInfo {
        self.lock().info.clone()
    }

    fn link_properties(&self) -> Option<LinkProperties> {
        self.lock().link.clone()
    }

    fn reconnect(&self) -> bool {
        let ok = {
            let mut inner = self.lock();
            inner.suppressed = false;
            inner.radio_on && inner.present
        };
        self.wake.notify_one();
        ok
    }

    fn teardown(&self) -> bool {
        let event = {
            let mut inner = self.lock();
            inner.suppressed = true;
            self.disconnect_locked(&mut inner, "torn down")
        };
        self.emit(event);
        true
    }

    fn set_teardown_requested(&self, requested: bool) {
        self.lock().teardown_requested = requested;
    }

    fn is_teardown_requested(&self) -> bool {
        self.lock().teardown_requested
    }

    fn set_radio(&self, on: bool) -> bool {
        let event = {
            let mut inner = self.lock();
            inner.radio_on = on;
            inner.info.is_available = inner.present && on;
            if on {
                None
            } else {
                self.disconnect_locked(&mut inner, "radio off")
            }
        };
        self.emit(event);
        self.wake.notify_one();
        true
    }

    fn set_user_data_enable(&self, enabled: bool) {
        self.lock().user_data_enabled = enabled;
        self.wake.notify_one();
    }

    fn set_policy_data_enable(&self, enabled: bool) {
        self.lock().policy_data_enabled = enabled;
        self.wake.notify_one();
    }

    fn set_dependency_met(&self, met: bool) {
        self.lock().dependency_met = met;
        self.wake.notify_one();
    }

    fn is_available(&self) -> bool {
        self.lock().info.is_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TrackerEvent>>);

    impl EventSink for Collect {
        fn post(&self, event: TrackerEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Collect {
        fn take(&self) -> Vec<TrackerEvent> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn tracker(network_type: NetworkType) -> (InterfaceTracker, Arc<Collect>) {
        let tracker = InterfaceTracker::new(
            network_type,
            "wlan0".to_string(),
            vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            Arc::new(Notify::new()),
        );
        let sink = Arc::new(Collect::default());
        tracker.attach(sink.clone());
        (tracker, sink)
    }

    fn up(gateway: Option<IpAddr>) -> Observation {
        Observation {
            present: true,
            oper_up: true,
            addresses: vec![LinkAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 24)],
            gateway,
        }
    }

    fn gw() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
    }

    #[test]
    fn link_up_connects_once() {
        let (tracker, sink) = tracker(NetworkType::WIFI);
        tracker.observe(up(gw()));
        tracker.observe(up(gw()));

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TrackerEvent::StateChanged(info) if info.is_connected()));
        let lp = tracker.link_properties().unwrap();
        assert_eq!(lp.interface(), Some("wlan0"));
        assert_eq!(lp.default_routes().count(), 1);
        assert_eq!(lp.dns_servers.len(), 1);
    }

    #[test]
    fn gateway_sticks_while_the_link_stays_up() {
        let (tracker, sink) = tracker(NetworkType::WIFI);
        tracker.observe(up(gw()));
        tracker.observe(up(None));
        assert_eq!(sink.take().len(), 1);
        assert_eq!(tracker.link_properties().unwrap().default_routes().count(), 1);
    }

    #[test]
    fn teardown_hides_the_link_until_reconnect() {
        let (tracker, sink) = tracker(NetworkType::WIFI);
        tracker.observe(up(gw()));
        sink.take();

        assert!(tracker.teardown());
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert!(!events[0].info().is_connected());

        tracker.observe(up(gw()));
        assert!(sink.take().is_empty());

        assert!(tracker.reconnect());
        tracker.observe(up(gw()));
        assert!(tracker.network_info().is_connected());
    }

    #[test]
    fn mobile_respects_user_data() {
        let (tracker, sink) = tracker(NetworkType::MOBILE);
        tracker.set_user_data_enable(false);
        tracker.observe(up(gw()));
        assert!(sink.take().is_empty());
        assert!(!tracker.network_info().is_connected());

        tracker.set_user_data_enable(true);
        tracker.observe(up(gw()));
        assert!(tracker.network_info().is_connected());
    }

    #[test]
    fn address_change_is_a_configuration_change() {
        let (tracker, sink) = tracker(NetworkType::WIFI);
        tracker.observe(up(gw()));
        let mut moved = up(gw());
        moved.addresses = vec![LinkAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21)), 24)];
        tracker.observe(moved);

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TrackerEvent::ConfigurationChanged(_)));
    }

    #[test]
    fn link_down_disconnects() {
        let (tracker, sink) = tracker(NetworkType::WIFI);
        tracker.observe(up(gw()));
        tracker.observe(Observation {
            present: true,
            ..Observation::default()
        });
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].info().reason.as_deref(), Some("link down"));
    }
}
