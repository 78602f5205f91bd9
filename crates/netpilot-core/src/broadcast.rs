use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::proxy::ProxyInfo;
use crate::types::{NetworkInfo, NetworkType};

/// Immediate broadcasts go out as soon as the state is known; delayed ones
/// follow after the connectivity-change delay so listeners see settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Immediate,
    Delayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityChange {
    pub info: NetworkInfo,
    pub other_network: Option<NetworkInfo>,
    pub no_connectivity: bool,
    pub is_failover: bool,
    pub inet_condition: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Broadcast {
    Connectivity {
        change: ConnectivityChange,
        delivery: Delivery,
    },
    InetCondition {
        info: NetworkInfo,
        condition: u8,
    },
    ProxyChange {
        proxy: Option<ProxyInfo>,
    },
    DnsChange {
        servers: Vec<IpAddr>,
        counter: u64,
    },
    /// Interface now carrying `network_type`, for usage accounting.
    InterfaceType {
        interface: String,
        network_type: NetworkType,
    },
}

pub trait BroadcastSink: Send + Sync {
    fn send(&self, broadcast: Broadcast);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingBroadcasts {
        sent: Arc<Mutex<Vec<Broadcast>>>,
    }

    impl RecordingBroadcasts {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<Broadcast> {
            self.sent.lock().unwrap().clone()
        }

        pub fn take(&self) -> Vec<Broadcast> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub fn connectivity(&self) -> Vec<(ConnectivityChange, Delivery)> {
            self.sent()
                .into_iter()
                .filter_map(|b| match b {
                    Broadcast::Connectivity { change, delivery } => Some((change, delivery)),
                    _ => None,
                })
                .collect()
        }

        pub fn inet_conditions(&self) -> Vec<(NetworkType, u8)> {
            self.sent()
                .into_iter()
                .filter_map(|b| match b {
                    Broadcast::InetCondition { info, condition } => {
                        Some((info.network_type, condition))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl BroadcastSink for RecordingBroadcasts {
        fn send(&self, broadcast: Broadcast) {
            self.sent.lock().unwrap().push(broadcast);
        }
    }
}
