use std::sync::Arc;

use tracing::warn;

use crate::config::NetworkTable;
use crate::link::LinkProperties;
use crate::types::{NetworkInfo, NetworkType};

/// A link driver for one network type. Implementations are shared between the
/// connectivity worker and API caller threads, so every method takes `&self`.
pub trait NetworkStateTracker: Send + Sync {
    fn network_info(&self) -> NetworkInfo;
    fn link_properties(&self) -> Option<LinkProperties>;

    fn reconnect(&self) -> bool;
    fn teardown(&self) -> bool;
    fn set_teardown_requested(&self, requested: bool);
    fn is_teardown_requested(&self) -> bool;

    fn set_radio(&self, on: bool) -> bool;
    fn set_user_data_enable(&self, enabled: bool);
    fn set_policy_data_enable(&self, enabled: bool);
    fn set_dependency_met(&self, met: bool);
    fn is_available(&self) -> bool;

    /// Comma-separated `rmem_min,rmem_def,rmem_max,wmem_min,wmem_def,wmem_max`.
    fn tcp_buffer_sizes(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    StateChanged(NetworkInfo),
    ConfigurationChanged(NetworkInfo),
}

impl TrackerEvent {
    pub fn info(&self) -> &NetworkInfo {
        match self {
            TrackerEvent::StateChanged(info) | TrackerEvent::ConfigurationChanged(info) => info,
        }
    }
}

/// Where trackers deliver their events.
pub trait EventSink: Send + Sync {
    fn post(&self, event: TrackerEvent);
}

/// Trackers indexed by network type. Only types present in the network table
/// are accepted.
#[derive(Clone, Default)]
pub struct TrackerSet {
    trackers: Vec<Option<Arc<dyn NetworkStateTracker>>>,
}

impl TrackerSet {
    pub fn new(
        table: &NetworkTable,
        trackers: Vec<(NetworkType, Arc<dyn NetworkStateTracker>)>,
    ) -> Self {
        let mut slots: Vec<Option<Arc<dyn NetworkStateTracker>>> =
            vec![None; NetworkType::MAX.index() + 1];
        for (network_type, tracker) in trackers {
            if !table.is_configured(network_type) {
                warn!(
                    "Ignoring tracker for {}: type is not configured",
                    network_type
                );
                continue;
            }
            if slots[network_type.index()].is_some() {
                warn!("Ignoring duplicate tracker for {}", network_type);
                continue;
            }
            slots[network_type.index()] = Some(tracker);
        }
        Self { trackers: slots }
    }

    pub fn get(&self, network_type: NetworkType) -> Option<&Arc<dyn NetworkStateTracker>> {
        self.trackers
            .get(network_type.index())
            .and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetworkType, &Arc<dyn NetworkStateTracker>)> {
        NetworkType::all().filter_map(move |t| self.get(t).map(|tracker| (t, tracker)))
    }
}
