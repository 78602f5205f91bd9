//! Inet-condition debouncing.
//!
//! Reachability reports for a network are noisy. Each domain opens a hold on
//! the first report, coalesces everything that arrives while the hold is
//! open, and publishes whatever condition is current when the hold ends.
//! Holds opened by an improving report are shorter than degrading ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NetworkType;

/// Conditions above this count as "internet reachable".
pub const INET_CONDITION_UP_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InetDomain {
    /// The active default network.
    Primary,
    /// The non-preferred member of a dual-default pair.
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetDomainState {
    pub network: Option<NetworkType>,
    pub condition: u8,
    pub published: u8,
    pub in_flight: bool,
    pub sequence: u64,
}

/// A hold that the caller must schedule to end after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub network: NetworkType,
    pub sequence: u64,
    pub delay: Duration,
}

impl InetDomainState {
    /// Starts tracking `network` from scratch; holds from before are stale.
    pub fn reset(&mut self, network: Option<NetworkType>) {
        self.network = network;
        self.condition = 0;
        self.published = 0;
        self.in_flight = false;
        self.sequence += 1;
    }

    pub fn report(
        &mut self,
        network: NetworkType,
        condition: u8,
        up: Duration,
        down: Duration,
    ) -> Option<Hold> {
        if self.network != Some(network) {
            return None;
        }
        self.condition = condition.min(100);
        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        let delay = if self.condition > INET_CONDITION_UP_THRESHOLD {
            up
        } else {
            down
        };
        Some(Hold {
            network,
            sequence: self.sequence,
            delay,
        })
    }

    /// Closes the hold numbered `sequence`. Returns the condition to publish,
    /// or `None` when the hold is stale, the network dropped, or nothing moved.
    pub fn hold_end(&mut self, sequence: u64, connected: bool) -> Option<u8> {
        if sequence != self.sequence || !self.in_flight {
            return None;
        }
        self.in_flight = false;
        if self.network.is_none() || !connected || self.published == self.condition {
            return None;
        }
        self.published = self.condition;
        Some(self.published)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetDomains {
    pub primary: InetDomainState,
    pub other: InetDomainState,
}

impl InetDomains {
    pub fn get(&self, domain: InetDomain) -> &InetDomainState {
        match domain {
            InetDomain::Primary => &self.primary,
            InetDomain::Other => &self.other,
        }
    }

    pub fn get_mut(&mut self, domain: InetDomain) -> &mut InetDomainState {
        match domain {
            InetDomain::Primary => &mut self.primary,
            InetDomain::Other => &mut self.other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP: Duration = Duration::from_millis(500);
    const DOWN: Duration = Duration::from_millis(3000);

    fn tracking(network: NetworkType) -> InetDomainState {
        let mut state = InetDomainState::default();
        state.reset(Some(network));
        state
    }

    #[test]
    fn reports_coalesce_into_one_hold() {
        let mut state = tracking(NetworkType::WIFI);
        let hold = state.report(NetworkType::WIFI, 30, UP, DOWN).unwrap();
        assert_eq!(hold.delay, DOWN);
        assert!(state.report(NetworkType::WIFI, 80, UP, DOWN).is_none());
        assert!(state.report(NetworkType::WIFI, 40, UP, DOWN).is_none());

        assert_eq!(state.hold_end(hold.sequence, true), Some(40));
        assert_eq!(state.published, 40);
        assert!(!state.in_flight);
    }

    #[test]
    fn improving_report_uses_short_hold() {
        let mut state = tracking(NetworkType::MOBILE);
        assert_eq!(state.report(NetworkType::MOBILE, 100, UP, DOWN).unwrap().delay, UP);
    }

    #[test]
    fn reports_for_other_networks_are_ignored() {
        let mut state = tracking(NetworkType::WIFI);
        assert!(state.report(NetworkType::MOBILE, 100, UP, DOWN).is_none());
        assert_eq!(state.condition, 0);
    }

    #[test]
    fn stale_hold_is_discarded() {
        let mut state = tracking(NetworkType::WIFI);
        let hold = state.report(NetworkType::WIFI, 100, UP, DOWN).unwrap();
        state.reset(Some(NetworkType::WIFI));
        assert_eq!(state.hold_end(hold.sequence, true), None);
        assert_eq!(state.published, 0);
    }

    #[test]
    fn disconnected_network_publishes_nothing() {
        let mut state = tracking(NetworkType::WIFI);
        let hold = state.report(NetworkType::WIFI, 100, UP, DOWN).unwrap();
        assert_eq!(state.hold_end(hold.sequence, false), None);
        assert!(state.report(NetworkType::WIFI, 100, UP, DOWN).is_some());
    }
}
