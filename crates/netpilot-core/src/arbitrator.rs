//! Default-network arbitration: which connected network carries the default
//! route, and what happens when it goes away.

use tracing::{debug, info, warn};

use crate::broadcast::{Broadcast, Delivery};
use crate::connectivity::Connectivity;
use crate::hsm::message::Message;
use crate::types::{NetworkInfo, NetworkType};

impl Connectivity {
    /// A network reached CONNECTED. For default types this decides between
    /// the newcomer and the current default.
    pub(crate) fn handle_connect(&mut self, info: &NetworkInfo) {
        let new_type = info.network_type;
        if self.is_default(new_type) {
            if let Some(active) = self.active_default.filter(|a| *a != new_type) {
                if !self.outranks(new_type, active) {
                    info!(
                        "Not switching default from {} to {}: keeping {}",
                        active, new_type, active
                    );
                    self.teardown(new_type);
                    return;
                }
                if !self.teardown(active) {
                    warn!(
                        "Failed to tear down {} for {}, dropping {}",
                        active, new_type, new_type
                    );
                    self.teardown(new_type);
                    return;
                }
            }
            if let Some(serial) = self.shared.wakelock.held_serial() {
                self.post_delayed(
                    Message::ClearTransitionWakelock { serial },
                    std::time::Duration::from_secs(1),
                );
            }
            info!("{} is now the default network", new_type);
            self.active_default = Some(new_type);
            self.inet.primary.reset(Some(new_type));
        }
        self.complete_connect(info);
    }

    /// Whether `candidate` should replace `current` as the default. The
    /// preferred network is never displaced; otherwise the lower priority
    /// value wins, and the newcomer wins ties.
    pub(crate) fn outranks(&self, candidate: NetworkType, current: NetworkType) -> bool {
        let preference = self.network_preference;
        if preference == current {
            return false;
        }
        candidate == preference || self.priority(current) >= self.priority(candidate)
    }

    /// Installs routes and DNS for a connection the arbitration accepted.
    pub(crate) fn complete_connect(&mut self, info: &NetworkInfo) {
        let network_type = info.network_type;
        if let Some(tracker) = self.tracker(network_type) {
            tracker.set_teardown_requested(false);
        }
        self.update_network_settings(network_type);
        self.handle_connectivity_change(network_type, false);
        self.send_connected_broadcast_delayed(info);

        if let Some(iface) = self
            .registry
            .current_lp(network_type)
            .and_then(|lp| lp.interface())
        {
            self.send(Broadcast::InterfaceType {
                interface: iface.to_string(),
                network_type,
            });
        }
    }

    /// Asks the tracker to disconnect. Returns true when a teardown is in
    /// progress afterwards.
    pub(crate) fn teardown(&mut self, network_type: NetworkType) -> bool {
        let Some(tracker) = self.tracker(network_type) else {
            return false;
        };
        if tracker.is_teardown_requested() {
            return true;
        }
        if tracker.teardown() {
            tracker.set_teardown_requested(true);
            true
        } else {
            false
        }
    }

    /// `prev` lost its connection: bring up every other default network that
    /// is not already on its way, best first.
    pub(crate) fn try_failover(&mut self, prev: NetworkType) {
        if !self.is_default(prev) {
            return;
        }
        if self.active_default == Some(prev) {
            self.active_default = None;
            let tag = format!("failover from {}", prev);
            if let Some(serial) = self.shared.wakelock.acquire(&tag) {
                let timeout = self.shared.config.wakelock_timeout();
                self.post_delayed(Message::ClearTransitionWakelock { serial }, timeout);
            }
        }

        let candidates: Vec<NetworkType> = self
            .table()
            .priority_order()
            .iter()
            .copied()
            .filter(|t| *t != prev && self.is_default(*t))
            .collect();
        for candidate in candidates {
            let Some(tracker) = self.tracker(candidate) else {
                continue;
            };
            let info = tracker.network_info();
            if info.is_connected_or_connecting() && !tracker.is_teardown_requested() {
                continue;
            }
            info!("Attempting failover from {} to {}", prev, candidate);
            if let Some(row) = self.registry.get_mut(candidate) {
                row.failover_pending = true;
            }
            if !tracker.reconnect() {
                debug!("Failover reconnect of {} refused", candidate);
            }
        }
    }

    /// True when no other connected network still uses `network_type`'s
    /// interface, so its sockets may be reset.
    pub(crate) fn should_reset(&self, network_type: NetworkType) -> bool {
        let Some(iface) = self
            .registry
            .current_lp(network_type)
            .and_then(|lp| lp.interface())
        else {
            return true;
        };
        !self.shared.trackers.iter().any(|(t, tracker)| {
            t != network_type
                && tracker.network_info().is_connected()
                && tracker
                    .link_properties()
                    .is_some_and(|lp| lp.interface() == Some(iface))
        })
    }

    /// Fills in the fallback network (or its absence) for a lost connection.
    fn disconnect_change(&mut self, info: &NetworkInfo) -> crate::broadcast::ConnectivityChange {
        let network_type = info.network_type;
        let mut change = self.connectivity_change(info);
        if self.is_default(network_type) {
            self.try_failover(network_type);
            match self.active_default.and_then(|a| self.tracker(a)) {
                Some(active) => change.other_network = Some(active.network_info()),
                None => {
                    change.no_connectivity = true;
                    self.inet.primary.published = 0;
                    change.inet_condition = 0;
                }
            }
        }
        change
    }

    pub(crate) fn handle_disconnect(&mut self, info: &NetworkInfo) {
        let network_type = info.network_type;
        if let Some(tracker) = self.tracker(network_type) {
            tracker.set_teardown_requested(false);
        }
        let change = self.disconnect_change(info);

        let do_reset = self.should_reset(network_type);
        self.handle_connectivity_change(network_type, do_reset);

        self.send_connectivity(change.clone(), Delivery::Immediate);
        self.send_connectivity(change, Delivery::Delayed);

        if let Some(active) = self.active_default.and_then(|a| self.tracker(a)) {
            let info = active.network_info();
            self.send_connected_broadcast_delayed(&info);
        }
    }

    /// A connection attempt failed. Routes never went up, so only failover
    /// and broadcasts happen.
    pub(crate) fn handle_connection_failure(&mut self, info: &NetworkInfo) {
        let network_type = info.network_type;
        if let Some(tracker) = self.tracker(network_type) {
            tracker.set_teardown_requested(false);
        }
        info!(
            "Attempt to connect to {} failed{}",
            network_type,
            info.reason
                .as_deref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default()
        );
        let change = self.disconnect_change(info);
        self.send_connectivity(change.clone(), Delivery::Immediate);
        self.send(Broadcast::Connectivity {
            change,
            delivery: Delivery::Delayed,
        });

        if let Some(active) = self.active_default.and_then(|a| self.tracker(a)) {
            let info = active.network_info();
            self.send_connected_broadcast(&info);
        }
    }
}
