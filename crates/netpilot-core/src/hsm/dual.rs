//! Dual-default states: both wifi and mobile carry default routes, the
//! preferred one at a lower metric. `WifiDefault` prefers wifi,
//! `MobileDefault` prefers mobile.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::message::Message;
use super::smart::{dual_state_for, ConnectedDefaultNetworkSet};
use super::{Disposition, StateId};
use crate::broadcast::Delivery;
use crate::connectivity::Connectivity;
use crate::inet::InetDomain;
use crate::tracker::TrackerEvent;
use crate::types::{DetailedState, NetworkInfo, NetworkType, State};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualPair {
    /// Preferred network of the state.
    pub mine: NetworkType,
    pub other: NetworkType,
    /// Network whose resolvers are listed first.
    pub dns_first: NetworkType,
}

impl DualPair {
    pub fn for_state(state: StateId) -> Option<DualPair> {
        let mine = match state {
            StateId::WifiDefault => NetworkType::WIFI,
            StateId::MobileDefault => NetworkType::MOBILE,
            _ => return None,
        };
        let other = ConnectedDefaultNetworkSet::partner(mine)?;
        Some(DualPair {
            mine,
            other,
            dns_first: mine,
        })
    }

    pub fn contains(&self, network_type: NetworkType) -> bool {
        self.mine == network_type || self.other == network_type
    }

    pub fn partner(&self, network_type: NetworkType) -> Option<NetworkType> {
        if network_type == self.mine {
            Some(self.other)
        } else if network_type == self.other {
            Some(self.mine)
        } else {
            None
        }
    }
}

fn set_metric(ctx: &mut Connectivity, network_type: NetworkType, metric: Option<u32>) {
    if let Some(row) = ctx.registry.get_mut(network_type) {
        row.attrs.metric = metric;
    }
}

fn republish(ctx: &mut Connectivity, network_type: NetworkType, metric: u32) {
    if let Some(lp) = ctx.registry.current_lp(network_type).cloned() {
        ctx.reconciler.republish_default_routes(&lp, metric);
    }
}

pub(crate) fn enter(state: StateId, ctx: &mut Connectivity) {
    let Some(pair) = DualPair::for_state(state) else {
        return;
    };
    let preferred = ctx.shared.config.dual_preferred_metric;
    let other = ctx.shared.config.dual_other_metric;
    info!(
        target: "route",
        "Dual default: {} at metric {}, {} at metric {}",
        pair.mine, preferred, pair.other, other
    );
    ctx.dual = Some(pair);
    set_metric(ctx, pair.mine, Some(preferred));
    set_metric(ctx, pair.other, Some(other));
    republish(ctx, pair.mine, preferred);
    republish(ctx, pair.other, other);
    ctx.publish_ordered_dns(pair.mine, Some(pair.other));
}

pub(crate) fn exit(ctx: &mut Connectivity) {
    ctx.dual = None;
    let types: Vec<NetworkType> = ctx.registry.iter().map(|row| row.network_type()).collect();
    for network_type in types {
        set_metric(ctx, network_type, None);
    }
}

/// The second network of the pair came up: install it alongside.
fn join(ctx: &mut Connectivity, info: &NetworkInfo) {
    ctx.complete_connect(info);
    ctx.inet.other.reset(Some(info.network_type));
}

/// The preferred network left; its partner becomes the only default.
fn promote(ctx: &mut Connectivity, pair: DualPair) {
    info!("{} left, {} is now the only default network", pair.mine, pair.other);
    ctx.active_default = Some(pair.other);
    ctx.dual = None;
    set_metric(ctx, pair.mine, None);
    set_metric(ctx, pair.other, None);
    republish(ctx, pair.other, 0);
    ctx.handle_dns_configuration_change(pair.other);
    ctx.inet.primary.reset(Some(pair.other));
    ctx.inet.other.reset(None);
}

/// The secondary network left while the preferred one stays.
fn drop_other(ctx: &mut Connectivity, pair: DualPair, info: &NetworkInfo) {
    if let Some(tracker) = ctx.tracker(pair.other) {
        tracker.set_teardown_requested(false);
    }
    let mut change = ctx.connectivity_change(info);
    if let Some(active) = ctx.active_default.and_then(|a| ctx.tracker(a)) {
        change.other_network = Some(active.network_info());
    }
    let do_reset = ctx.should_reset(pair.other);
    ctx.handle_connectivity_change(pair.other, do_reset);
    ctx.send_connectivity(change.clone(), Delivery::Immediate);
    ctx.send_connectivity(change, Delivery::Delayed);
    ctx.inet.other.reset(None);
    ctx.connected_defaults.remove(pair.other);
    ctx.publish_ordered_dns(pair.mine, None);
}

fn is_better_than_members(ctx: &Connectivity, network_type: NetworkType) -> bool {
    ctx.connected_defaults
        .members()
        .iter()
        .all(|member| ctx.outranks(network_type, *member))
}

fn sibling(state: StateId) -> StateId {
    match state {
        StateId::WifiDefault => StateId::MobileDefault,
        _ => StateId::WifiDefault,
    }
}

pub(crate) fn handle(state: StateId, ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    let Some(pair) = ctx.dual else {
        return Disposition::NotHandled;
    };
    match msg {
        Message::Tracker(TrackerEvent::StateChanged(info)) => {
            let info = info.clone();
            let network_type = info.network_type;
            if info.state == State::Connected {
                connect(ctx, pair, &info)
            } else if matches!(info.state, State::Disconnected | State::Suspended)
                && info.detailed_state != DetailedState::Idle
            {
                if network_type == pair.mine {
                    promote(ctx, pair);
                    ctx.connected_defaults.remove(pair.mine);
                    Disposition::DeferTo(StateId::Smart)
                } else if network_type == pair.other {
                    drop_other(ctx, pair, &info);
                    Disposition::Handled
                } else {
                    Disposition::NotHandled
                }
            } else {
                Disposition::NotHandled
            }
        }
        Message::SwitchConnectivity(target) => {
            let target = *target;
            if !ctx.connected_defaults.contains(target) || ctx.active_default == Some(target) {
                debug!(target: "hsm", "Switch to {} ignored", target);
                return Disposition::Handled;
            }
            if target == pair.mine {
                ctx.active_default = Some(target);
                ctx.handle_dns_configuration_change(target);
                ctx.inet.primary.reset(Some(target));
                if let Some(tracker) = ctx.tracker(target) {
                    let info = tracker.network_info();
                    ctx.send_connected_broadcast_delayed(&info);
                }
                Disposition::Handled
            } else {
                info!("Switching preferred default to {}", target);
                Disposition::DeferTo(sibling(state))
            }
        }
        Message::ReprioritizeDns(network_type) => {
            let first = *network_type;
            if !pair.contains(first) {
                return Disposition::Handled;
            }
            if let Some(dual) = ctx.dual.as_mut() {
                dual.dns_first = first;
            }
            ctx.publish_ordered_dns(first, pair.partner(first));
            Disposition::Handled
        }
        Message::InetConditionChange {
            network_type,
            condition,
        } if *network_type == pair.other => {
            ctx.inet_report(InetDomain::Other, pair.other, *condition);
            Disposition::Handled
        }
        _ => Disposition::NotHandled,
    }
}

fn connect(ctx: &mut Connectivity, pair: DualPair, info: &NetworkInfo) -> Disposition {
    let network_type = info.network_type;
    if network_type == pair.mine {
        return Disposition::NotHandled;
    }
    if network_type == pair.other {
        if !ctx.connected_defaults.contains(network_type) {
            ctx.connected_defaults.insert(network_type);
        }
        join(ctx, info);
        return Disposition::Handled;
    }
    if !ctx.is_default(network_type) {
        return Disposition::NotHandled;
    }
    if is_better_than_members(ctx, network_type) {
        info!(
            "{} outranks the dual defaults, tearing down {:?}",
            network_type,
            ctx.connected_defaults.members()
        );
        let members = ctx.connected_defaults.members().to_vec();
        for member in members {
            ctx.teardown(member);
        }
        ctx.connected_defaults.clear();
        return Disposition::DeferTo(StateId::Smart);
    }
    let metric = ctx.shared.config.dual_other_metric.saturating_add(1);
    info!(
        target: "route",
        "{} joins below the dual defaults at metric {}", network_type, metric
    );
    set_metric(ctx, network_type, Some(metric));
    ctx.complete_connect(info);
    Disposition::Handled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_for_each_dual_state() {
        let wifi = DualPair::for_state(StateId::WifiDefault).unwrap();
        assert_eq!(wifi.mine, NetworkType::WIFI);
        assert_eq!(wifi.other, NetworkType::MOBILE);
        assert_eq!(wifi.partner(NetworkType::MOBILE), Some(NetworkType::WIFI));

        let mobile = DualPair::for_state(StateId::MobileDefault).unwrap();
        assert_eq!(mobile.mine, NetworkType::MOBILE);
        assert!(DualPair::for_state(StateId::Smart).is_none());
    }

    #[test]
    fn dual_state_matches_the_active_network() {
        assert_eq!(dual_state_for(NetworkType::WIFI), StateId::WifiDefault);
        assert_eq!(dual_state_for(NetworkType::MOBILE), StateId::MobileDefault);
    }
}
