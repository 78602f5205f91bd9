use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::broadcast::Broadcast;
use crate::dns::DnsOverride;
use crate::inet::InetDomain;
use crate::proxy::ProxyInfo;
use crate::tracker::TrackerEvent;
use crate::types::NetworkType;

/// Everything the worker reacts to: tracker events, API commands and timers.
#[derive(Debug)]
pub enum Message {
    Tracker(TrackerEvent),
    InetConditionChange {
        network_type: NetworkType,
        condition: u8,
    },
    InetConditionHoldEnd {
        domain: InetDomain,
        sequence: u64,
    },
    SetNetworkPreference(NetworkType),
    /// Expiry of a feature request with a restore time.
    RestoreDefaultNetwork {
        user_id: u64,
    },
    SetMobileData(bool),
    SetPolicyDataEnable {
        network_type: NetworkType,
        enabled: bool,
    },
    SetDependencyMet {
        network_type: NetworkType,
        met: bool,
    },
    ClearTransitionWakelock {
        serial: u64,
    },
    DnsConfigurationChange(NetworkType),
    OverrideDns(DnsOverride),
    RestoreDns,
    SetGlobalProxy(Option<ProxyInfo>),
    SendBroadcast(Broadcast),
    RequestRouteToHost {
        network_type: NetworkType,
        address: IpAddr,
        pid: u32,
        reply: Option<oneshot::Sender<bool>>,
    },
    ProcessDied(u32),
    ReloadSettings,
    StartFmc,
    StopFmc,
    SwitchConnectivity(NetworkType),
    ReprioritizeDns(NetworkType),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Tracker(TrackerEvent::StateChanged(_)) => "state_changed",
            Message::Tracker(TrackerEvent::ConfigurationChanged(_)) => "configuration_changed",
            Message::InetConditionChange { .. } => "inet_condition_change",
            Message::InetConditionHoldEnd { .. } => "inet_condition_hold_end",
            Message::SetNetworkPreference(_) => "set_network_preference",
            Message::RestoreDefaultNetwork { .. } => "restore_default_network",
            Message::SetMobileData(_) => "set_mobile_data",
            Message::SetPolicyDataEnable { .. } => "set_policy_data_enable",
            Message::SetDependencyMet { .. } => "set_dependency_met",
            Message::ClearTransitionWakelock { .. } => "clear_transition_wakelock",
            Message::DnsConfigurationChange(_) => "dns_configuration_change",
            Message::OverrideDns(_) => "override_dns",
            Message::RestoreDns => "restore_dns",
            Message::SetGlobalProxy(_) => "set_global_proxy",
            Message::SendBroadcast(_) => "send_broadcast",
            Message::RequestRouteToHost { .. } => "request_route_to_host",
            Message::ProcessDied(_) => "process_died",
            Message::ReloadSettings => "reload_settings",
            Message::StartFmc => "start_fmc",
            Message::StopFmc => "stop_fmc",
            Message::SwitchConnectivity(_) => "switch_connectivity",
            Message::ReprioritizeDns(_) => "reprioritize_dns",
        }
    }
}

/// A message waiting to be dispatched, with the number of times a state
/// has pushed it back.
#[derive(Debug)]
pub struct Queued {
    pub msg: Message,
    pub redeliveries: u32,
}

struct Delayed {
    due: Instant,
    seq: u64,
    msg: Message,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the max-heap pops the earliest due time first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// FIFO of ready messages plus a timer heap. Deferred messages go back to
/// the front.
#[derive(Default)]
pub struct MessageQueue {
    ready: VecDeque<Queued>,
    delayed: BinaryHeap<Delayed>,
    seq: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, msg: Message) {
        self.ready.push_back(Queued {
            msg,
            redeliveries: 0,
        });
    }

    pub fn push_front(&mut self, queued: Queued) {
        self.ready.push_front(queued);
    }

    pub fn push_delayed(&mut self, msg: Message, due: Instant) {
        self.seq += 1;
        self.delayed.push(Delayed {
            due,
            seq: self.seq,
            msg,
        });
    }

    /// Moves every timer due at `now` onto the ready queue, earliest first.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.push_back(delayed.msg);
                promoted += 1;
            }
        }
        promoted
    }

    pub fn pop(&mut self) -> Option<Queued> {
        self.ready.pop_front()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.due)
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn names(queue: &mut MessageQueue) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.pop().map(|q| q.msg.name())).collect()
    }

    #[test]
    fn deferred_message_jumps_the_queue() {
        let mut queue = MessageQueue::new();
        queue.push_back(Message::StartFmc);
        queue.push_back(Message::StopFmc);
        let first = queue.pop().unwrap();
        queue.push_front(Queued {
            msg: first.msg,
            redeliveries: 1,
        });
        assert_eq!(names(&mut queue), vec!["start_fmc", "stop_fmc"]);
    }

    #[test]
    fn timers_fire_in_due_order() {
        let mut queue = MessageQueue::new();
        let now = Instant::now();
        queue.push_delayed(Message::RestoreDns, now + Duration::from_millis(300));
        queue.push_delayed(Message::StartFmc, now + Duration::from_millis(100));
        queue.push_delayed(Message::StopFmc, now + Duration::from_millis(100));

        assert_eq!(queue.promote_due(now), 0);
        assert_eq!(queue.next_due(), Some(now + Duration::from_millis(100)));
        assert_eq!(queue.promote_due(now + Duration::from_millis(100)), 2);
        assert_eq!(names(&mut queue), vec!["start_fmc", "stop_fmc"]);
        assert_eq!(queue.delayed_len(), 1);
    }
}
