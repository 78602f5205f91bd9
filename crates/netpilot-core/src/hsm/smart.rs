//! Smart variant: wifi and mobile may both stay connected as defaults.

use tracing::debug;

use super::message::Message;
use super::{Disposition, StateId};
use crate::connectivity::Connectivity;
use crate::tracker::TrackerEvent;
use crate::types::{DetailedState, NetworkType, State};

/// Networks allowed to be default at the same time.
pub const DUAL_CAPABLE: [NetworkType; 2] = [NetworkType::WIFI, NetworkType::MOBILE];

/// Connected default networks while the smart variant runs. Holds at most
/// the wifi/mobile pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedDefaultNetworkSet {
    members: Vec<NetworkType>,
}

impl ConnectedDefaultNetworkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_allowed(network_type: NetworkType) -> bool {
        DUAL_CAPABLE.contains(&network_type)
    }

    /// The other half of the dual-capable pair.
    pub fn partner(network_type: NetworkType) -> Option<NetworkType> {
        match network_type {
            NetworkType::WIFI => Some(NetworkType::MOBILE),
            NetworkType::MOBILE => Some(NetworkType::WIFI),
            _ => None,
        }
    }

    pub fn insert(&mut self, network_type: NetworkType) -> bool {
        if !Self::is_allowed(network_type) || self.contains(network_type) {
            return false;
        }
        self.members.push(network_type);
        true
    }

    pub fn remove(&mut self, network_type: NetworkType) -> bool {
        let before = self.members.len();
        self.members.retain(|t| *t != network_type);
        self.members.len() != before
    }

    pub fn contains(&self, network_type: NetworkType) -> bool {
        self.members.contains(&network_type)
    }

    pub fn reset_to(&mut self, network_type: NetworkType) {
        self.members.clear();
        self.insert(network_type);
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[NetworkType] {
        &self.members
    }
}

pub(crate) fn dual_state_for(active: NetworkType) -> StateId {
    if active == NetworkType::WIFI {
        StateId::WifiDefault
    } else {
        StateId::MobileDefault
    }
}

pub(crate) fn handle(ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    let Message::Tracker(TrackerEvent::StateChanged(info)) = msg else {
        return Disposition::NotHandled;
    };
    let network_type = info.network_type;

    if info.state == State::Connected {
        if !ctx.is_default(network_type) || ctx.connected_defaults.contains(network_type) {
            return Disposition::NotHandled;
        }
        if let Some(active) = ctx.active_default {
            let partner = ConnectedDefaultNetworkSet::partner(network_type);
            if partner == Some(active)
                && ctx.connected_defaults.members() == [active]
            {
                debug!(target: "hsm", "{} joins {} as a second default", network_type, active);
                ctx.connected_defaults.insert(network_type);
                return Disposition::DeferTo(dual_state_for(active));
            }
        }
        ctx.handle_connect(info);
        if ctx.active_default == Some(network_type) {
            if ConnectedDefaultNetworkSet::is_allowed(network_type) {
                ctx.connected_defaults.reset_to(network_type);
            } else {
                ctx.connected_defaults.clear();
            }
        }
        return Disposition::Handled;
    }

    if matches!(info.state, State::Disconnected | State::Suspended)
        && info.detailed_state != DetailedState::Idle
    {
        ctx.connected_defaults.remove(network_type);
    }
    Disposition::NotHandled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_only_admits_the_dual_pair() {
        let mut set = ConnectedDefaultNetworkSet::new();
        assert!(set.insert(NetworkType::WIFI));
        assert!(!set.insert(NetworkType::WIFI));
        assert!(!set.insert(NetworkType::ETHERNET));
        assert!(set.insert(NetworkType::MOBILE));
        assert_eq!(set.len(), 2);

        set.reset_to(NetworkType::ETHERNET);
        assert!(set.is_empty());
        set.reset_to(NetworkType::MOBILE);
        assert_eq!(set.members(), &[NetworkType::MOBILE]);
    }

    #[test]
    fn partners_pair_up() {
        assert_eq!(
            ConnectedDefaultNetworkSet::partner(NetworkType::WIFI),
            Some(NetworkType::MOBILE)
        );
        assert_eq!(ConnectedDefaultNetworkSet::partner(NetworkType::WIMAX), None);
    }
}
