use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{DetailedState, NetworkInfo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UidRule {
    #[default]
    Allow,
    RejectMetered,
}

/// Per-uid network policy rules.
#[derive(Debug, Default)]
pub struct UidPolicy {
    rules: Mutex<HashMap<u32, UidRule>>,
}

impl UidPolicy {
    pub fn new(initial: HashMap<u32, UidRule>) -> Self {
        Self {
            rules: Mutex::new(initial),
        }
    }

    /// Returns true if the stored rule changed.
    pub fn set_rule(&self, uid: u32, rule: UidRule) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let previous = rules.get(&uid).copied().unwrap_or_default();
        if previous == rule {
            return false;
        }
        debug!("Uid {} rule {:?} -> {:?}", uid, previous, rule);
        if rule == UidRule::Allow {
            rules.remove(&uid);
        } else {
            rules.insert(uid, rule);
        }
        true
    }

    pub fn rule(&self, uid: u32) -> UidRule {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.get(&uid).copied().unwrap_or_default()
    }

    pub fn is_blocked(&self, uid: u32, metered: bool) -> bool {
        metered && self.rule(uid) == UidRule::RejectMetered
    }

    pub fn replace_all(&self, rules: HashMap<u32, UidRule>) {
        let mut guard = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        *guard = rules;
    }

    pub fn snapshot(&self) -> HashMap<u32, UidRule> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Copy of `info` as `uid` is allowed to see it.
    pub fn filter_info(&self, info: &NetworkInfo, uid: u32, metered: bool) -> NetworkInfo {
        let mut info = info.clone();
        if self.is_blocked(uid, metered) {
            info.set_detailed_state(DetailedState::Blocked, None, None);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkType, State};

    #[test]
    fn reject_metered_only_blocks_metered_networks() {
        let policy = UidPolicy::default();
        assert!(policy.set_rule(10_001, UidRule::RejectMetered));
        assert!(!policy.set_rule(10_001, UidRule::RejectMetered));

        assert!(policy.is_blocked(10_001, true));
        assert!(!policy.is_blocked(10_001, false));
        assert!(!policy.is_blocked(10_002, true));
    }

    #[test]
    fn blocked_info_is_reported_disconnected() {
        let policy = UidPolicy::default();
        policy.set_rule(10_001, UidRule::RejectMetered);

        let mut info = NetworkInfo::new(NetworkType::MOBILE);
        info.set_detailed_state(DetailedState::Connected, None, None);

        let filtered = policy.filter_info(&info, 10_001, true);
        assert_eq!(filtered.detailed_state, DetailedState::Blocked);
        assert_eq!(filtered.state, State::Disconnected);
        assert!(info.is_connected());
    }

    #[test]
    fn allow_removes_entry() {
        let policy = UidPolicy::default();
        policy.set_rule(1, UidRule::RejectMetered);
        policy.set_rule(1, UidRule::Allow);
        assert!(policy.snapshot().is_empty());
    }
}
