#[cfg(not(target_os = "linux"))]
compile_error!("netpilot-core drives the Linux routing tables and only builds for Linux targets.");

mod arbitrator;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod dns;
pub mod error;
pub mod features;
pub mod hsm;
pub mod inet;
pub mod link;
pub mod netd;
pub mod policy;
pub mod proxy;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod settings;
pub mod tracker;
pub mod types;
pub mod wakelock;

#[cfg(test)]
mod scenarios;

pub use broadcast::{Broadcast, BroadcastSink, ConnectivityChange, Delivery};
pub use config::{CoreConfig, NetworkConfig, NetworkTable, Variant};
pub use connectivity::{LinkEntry, Snapshot};
pub use dns::{DnsOverride, DnsSnapshot};
pub use error::{CoreError, Result};
pub use features::{FeatureUser, StartResult, StopResult};
pub use hsm::fmc::FmcStatus;
pub use hsm::StateId;
pub use link::{LinkAddress, LinkProperties, RouteInfo};
pub use netd::{Netd, RealNetd, ResetMask};
pub use policy::UidRule;
pub use proxy::ProxyInfo;
pub use service::{ConnectivityService, ServiceHandle, ServiceParts};
pub use settings::{Settings, SettingsStore};
pub use tracker::{EventSink, NetworkStateTracker, TrackerEvent};
pub use types::{DetailedState, NetworkInfo, NetworkType, State};
pub use wakelock::WakelockStatus;
