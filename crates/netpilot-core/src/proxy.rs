use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub exclusion_list: Option<String>,
}

impl ProxyInfo {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            exclusion_list: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

#[derive(Debug, Default)]
struct ProxySlots {
    default: Option<ProxyInfo>,
    global: Option<ProxyInfo>,
}

/// Default proxy (from the active default's link properties) and the user's
/// global proxy. A global proxy, when set, overrides the default one.
#[derive(Debug, Default)]
pub struct ProxyState {
    slots: Mutex<ProxySlots>,
}

impl ProxyState {
    pub fn new(global: Option<ProxyInfo>) -> Self {
        Self {
            slots: Mutex::new(ProxySlots {
                default: None,
                global: global.filter(ProxyInfo::is_valid),
            }),
        }
    }

    pub fn effective(&self) -> Option<ProxyInfo> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.global.clone().or_else(|| slots.default.clone())
    }

    pub fn global(&self) -> Option<ProxyInfo> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.global.clone()
    }

    /// Returns true when the effective proxy changed and should be broadcast.
    pub fn set_global(&self, proxy: Option<ProxyInfo>) -> bool {
        let proxy = proxy.filter(ProxyInfo::is_valid);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.global == proxy {
            return false;
        }
        debug!("Global proxy set to {:?}", proxy);
        let before = slots.global.clone().or_else(|| slots.default.clone());
        slots.global = proxy;
        let after = slots.global.clone().or_else(|| slots.default.clone());
        before != after
    }

    /// Returns true when the change is visible, i.e. no global proxy masks it.
    pub fn set_default(&self, proxy: Option<ProxyInfo>) -> bool {
        let proxy = proxy.filter(ProxyInfo::is_valid);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.default == proxy {
            return false;
        }
        debug!("Default proxy set to {:?}", proxy);
        slots.default = proxy;
        slots.global.is_none()
    }
}
