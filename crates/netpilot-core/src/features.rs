//! Bookkeeping for "start using network feature" requests.
//!
//! A feature request asks for a special-purpose network (MMS, SUPL, DUN ...)
//! on behalf of a process. The network stays up while at least one requesting
//! pid remains; requests with a restore time also expire on their own.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NetworkTable;
use crate::policy::UidPolicy;
use crate::tracker::TrackerSet;
use crate::types::NetworkType;

pub const FEATURE_ENABLE_MMS: &str = "enableMMS";
pub const FEATURE_ENABLE_SUPL: &str = "enableSUPL";
pub const FEATURE_ENABLE_DUN: &str = "enableDUN";
pub const FEATURE_ENABLE_DUN_ALWAYS: &str = "enableDUNAlways";
pub const FEATURE_ENABLE_HIPRI: &str = "enableHIPRI";
pub const FEATURE_ENABLE_FOTA: &str = "enableFOTA";
pub const FEATURE_ENABLE_IMS: &str = "enableIMS";
pub const FEATURE_ENABLE_CBS: &str = "enableCBS";
pub const FEATURE_WIFI_P2P: &str = "p2p";

/// Concrete network type serving `feature` on `network_type`, or `None` when
/// the pair has no dedicated type.
pub fn feature_to_network_type(network_type: NetworkType, feature: &str) -> Option<NetworkType> {
    match network_type {
        NetworkType::MOBILE => match feature {
            FEATURE_ENABLE_MMS => Some(NetworkType::MOBILE_MMS),
            FEATURE_ENABLE_SUPL => Some(NetworkType::MOBILE_SUPL),
            FEATURE_ENABLE_DUN | FEATURE_ENABLE_DUN_ALWAYS => Some(NetworkType::MOBILE_DUN),
            FEATURE_ENABLE_HIPRI => Some(NetworkType::MOBILE_HIPRI),
            FEATURE_ENABLE_FOTA => Some(NetworkType::MOBILE_FOTA),
            FEATURE_ENABLE_IMS => Some(NetworkType::MOBILE_IMS),
            FEATURE_ENABLE_CBS => Some(NetworkType::MOBILE_CBS),
            _ => None,
        },
        NetworkType::WIFI if feature == FEATURE_WIFI_P2P => Some(NetworkType::WIFI_P2P),
        _ => None,
    }
}

fn used_network_type(network_type: NetworkType, feature: &str) -> NetworkType {
    feature_to_network_type(network_type, feature).unwrap_or_else(|| {
        debug!("No dedicated network for {} feature '{}'", network_type, feature);
        network_type
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartResult {
    AlreadyActive,
    RequestStarted,
    TypeNotAvailable,
    RequestFailed,
    /// No tracker serves the mapped type; the request is still remembered.
    NoFeatureMapping,
}

impl StartResult {
    pub fn code(self) -> i32 {
        match self {
            StartResult::AlreadyActive => 0,
            StartResult::RequestStarted => 1,
            StartResult::TypeNotAvailable => 2,
            StartResult::RequestFailed => 3,
            StartResult::NoFeatureMapping => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopResult {
    Stopped,
    NotFound,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUser {
    pub id: u64,
    pub network_type: NetworkType,
    pub feature: String,
    pub pid: u32,
    pub uid: u32,
    pub created_at: SystemTime,
}

impl FeatureUser {
    pub fn is_same_user(&self, other: &FeatureUser) -> bool {
        self.pid == other.pid
            && self.uid == other.uid
            && self.network_type == other.network_type
            && self.feature == other.feature
    }

    fn matches(&self, request: &FeatureRequest) -> bool {
        self.pid == request.pid
            && self.uid == request.uid
            && self.network_type == request.network_type
            && self.feature == request.feature
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub network_type: NetworkType,
    pub feature: String,
    pub pid: u32,
    pub uid: u32,
}

/// What the caller must do after a start besides returning `result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub result: StartResult,
    /// Schedule expiry of this user after the delay.
    pub expire: Option<(u64, Duration)>,
    /// The network is already up; refresh its DNS configuration.
    pub refresh_dns: Option<NetworkType>,
}

impl StartOutcome {
    fn done(result: StartResult) -> Self {
        Self {
            result,
            expire: None,
            refresh_dns: None,
        }
    }
}

#[derive(Debug, Default)]
struct FeatureState {
    users: Vec<FeatureUser>,
    requesters: HashMap<NetworkType, Vec<u32>>,
    next_id: u64,
}

impl FeatureState {
    fn record(&mut self, request: &FeatureRequest, used: NetworkType, dedupe: bool) -> u64 {
        let existing = dedupe
            .then(|| self.users.iter().find(|u| u.matches(request)).map(|u| u.id))
            .flatten();
        let id = match existing {
            Some(id) => {
                debug!("Suppressing duplicate feature request {:?}", request);
                id
            }
            None => {
                self.next_id += 1;
                self.users.push(FeatureUser {
                    id: self.next_id,
                    network_type: request.network_type,
                    feature: request.feature.clone(),
                    pid: request.pid,
                    uid: request.uid,
                    created_at: SystemTime::now(),
                });
                self.next_id
            }
        };
        let pids = self.requesters.entry(used).or_default();
        if !pids.contains(&request.pid) {
            pids.push(request.pid);
        }
        id
    }
}

#[derive(Debug, Default)]
pub struct FeatureTracker {
    state: Mutex<FeatureState>,
}

impl FeatureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &self,
        request: &FeatureRequest,
        table: &NetworkTable,
        trackers: &TrackerSet,
        policy: &UidPolicy,
    ) -> StartOutcome {
        let used = used_network_type(request.network_type, &request.feature);
        let metered = table.get(used).map(|c| c.metered).unwrap_or(false);
        if policy.is_blocked(request.uid, metered) {
            info!(
                "Refusing {} for uid {}: metered networks rejected",
                request.feature, request.uid
            );
            return StartOutcome::done(StartResult::RequestFailed);
        }

        let Some(tracker) = trackers.get(used) else {
            // Remembered so the matching stop gets a sensible answer.
            self.lock().record(request, used, false);
            return StartOutcome::done(StartResult::NoFeatureMapping);
        };
        if used == request.network_type {
            return StartOutcome::done(StartResult::AlreadyActive);
        }

        let info = tracker.network_info();
        if !info.is_available && request.feature != FEATURE_ENABLE_DUN_ALWAYS {
            return StartOutcome::done(StartResult::TypeNotAvailable);
        }

        let restore_time = table.get(used).and_then(|c| c.restore_time);
        let id = self.lock().record(request, used, restore_time.is_none());
        let expire = restore_time.map(|delay| (id, delay));

        if info.is_connected_or_connecting() && !tracker.is_teardown_requested() {
            if info.is_connected() {
                return StartOutcome {
                    result: StartResult::AlreadyActive,
                    expire,
                    refresh_dns: Some(used),
                };
            }
            return StartOutcome {
                result: StartResult::RequestStarted,
                expire,
                refresh_dns: None,
            };
        }

        let result = if tracker.reconnect() {
            StartResult::RequestStarted
        } else {
            warn!("Reconnect of {} for {} failed", used, request.feature);
            StartResult::RequestFailed
        };
        StartOutcome {
            result,
            expire,
            refresh_dns: None,
        }
    }

    /// Explicit stop from the requester: duplicates do not keep it alive.
    pub fn stop(&self, request: &FeatureRequest, trackers: &TrackerSet) -> StopResult {
        let id = self
            .lock()
            .users
            .iter()
            .find(|u| u.matches(request))
            .map(|u| u.id);
        match id {
            Some(id) => self.stop_user(id, true, trackers),
            None => {
                debug!("No live feature request matches {:?}", request);
                StopResult::NotFound
            }
        }
    }

    /// Removes one user. With `ignore_dups` unset a remaining identical
    /// request keeps the network up.
    pub fn stop_user(&self, id: u64, ignore_dups: bool, trackers: &TrackerSet) -> StopResult {
        let (used, tracker) = {
            let mut state = self.lock();
            let Some(index) = state.users.iter().position(|u| u.id == id) else {
                return StopResult::NotFound;
            };
            let user = state.users.remove(index);
            if !ignore_dups && state.users.iter().any(|u| u.is_same_user(&user)) {
                debug!("Feature {} still requested by a duplicate", user.feature);
                return StopResult::Stopped;
            }

            let used = used_network_type(user.network_type, &user.feature);
            if let Some(pids) = state.requesters.get_mut(&used) {
                pids.retain(|pid| *pid != user.pid);
            }
            if used == user.network_type {
                return StopResult::Invalid;
            }
            let Some(tracker) = trackers.get(used) else {
                return StopResult::Invalid;
            };
            if state.requesters.get(&used).is_some_and(|pids| !pids.is_empty()) {
                return StopResult::Stopped;
            }
            (used, tracker.clone())
        };

        info!("Last requester of {} gone, tearing it down", used);
        if !tracker.teardown() {
            warn!("Teardown of {} failed", used);
        }
        StopResult::Stopped
    }

    /// Drops every request owned by `pid` and forgets it as a requester.
    pub fn process_died(&self, pid: u32, trackers: &TrackerSet) -> usize {
        let ids: Vec<u64> = {
            let mut state = self.lock();
            for pids in state.requesters.values_mut() {
                pids.retain(|p| *p != pid);
            }
            state.users.iter().filter(|u| u.pid == pid).map(|u| u.id).collect()
        };
        for id in &ids {
            self.stop_user(*id, false, trackers);
        }
        ids.len()
    }

    pub fn users(&self) -> Vec<FeatureUser> {
        self.lock().users.clone()
    }

    pub fn requester_pids(&self, network_type: NetworkType) -> Vec<u32> {
        self.lock()
            .requesters
            .get(&network_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Remembers `pid` as a user of `network_type` outside a feature request,
    /// as request-route-to-host does.
    pub fn add_requester(&self, network_type: NetworkType, pid: u32) {
        let mut state = self.lock();
        let pids = state.requesters.entry(network_type).or_default();
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }

    pub fn live_pids(&self) -> Vec<u32> {
        let state = self.lock();
        let mut pids: Vec<u32> = state.users.iter().map(|u| u.pid).collect();
        pids.extend(state.requesters.values().flatten().copied());
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeatureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
