use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identifies a transport. Values are sparse; a device only defines a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NetworkType(u8);

impl NetworkType {
    pub const MOBILE: NetworkType = NetworkType(0);
    pub const WIFI: NetworkType = NetworkType(1);
    pub const MOBILE_MMS: NetworkType = NetworkType(2);
    pub const MOBILE_SUPL: NetworkType = NetworkType(3);
    pub const MOBILE_DUN: NetworkType = NetworkType(4);
    pub const MOBILE_HIPRI: NetworkType = NetworkType(5);
    pub const WIMAX: NetworkType = NetworkType(6);
    pub const BLUETOOTH: NetworkType = NetworkType(7);
    pub const DUMMY: NetworkType = NetworkType(8);
    pub const ETHERNET: NetworkType = NetworkType(9);
    pub const MOBILE_FOTA: NetworkType = NetworkType(10);
    pub const MOBILE_IMS: NetworkType = NetworkType(11);
    pub const MOBILE_CBS: NetworkType = NetworkType(12);
    pub const WIFI_P2P: NetworkType = NetworkType(13);

    pub const MAX: NetworkType = NetworkType::WIFI_P2P;

    const NAMES: [&'static str; 14] = [
        "mobile",
        "wifi",
        "mobile_mms",
        "mobile_supl",
        "mobile_dun",
        "mobile_hipri",
        "wimax",
        "bluetooth",
        "dummy",
        "ethernet",
        "mobile_fota",
        "mobile_ims",
        "mobile_cbs",
        "wifi_p2p",
    ];

    pub fn new(raw: u8) -> Result<Self, CoreError> {
        if raw > Self::MAX.0 {
            return Err(CoreError::InvalidNetworkType(raw as i64));
        }
        Ok(NetworkType(raw))
    }

    pub fn from_i64(raw: i64) -> Result<Self, CoreError> {
        u8::try_from(raw)
            .map_err(|_| CoreError::InvalidNetworkType(raw))
            .and_then(Self::new)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        Self::NAMES[self.index()]
    }

    pub fn is_mobile(self) -> bool {
        matches!(
            self,
            NetworkType::MOBILE
                | NetworkType::MOBILE_MMS
                | NetworkType::MOBILE_SUPL
                | NetworkType::MOBILE_DUN
                | NetworkType::MOBILE_HIPRI
                | NetworkType::MOBILE_FOTA
                | NetworkType::MOBILE_IMS
                | NetworkType::MOBILE_CBS
        )
    }

    pub fn all() -> impl Iterator<Item = NetworkType> {
        (0..=Self::MAX.0).map(NetworkType)
    }
}

impl TryFrom<u8> for NetworkType {
    type Error = CoreError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<NetworkType> for u8 {
    fn from(t: NetworkType) -> u8 {
        t.0
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        if let Some(idx) = Self::NAMES.iter().position(|name| *name == needle) {
            return Ok(NetworkType(idx as u8));
        }
        needle
            .parse::<i64>()
            .map_err(|_| CoreError::UnknownNetworkName(s.to_string()))
            .and_then(Self::from_i64)
    }
}

/// Coarse connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Unknown,
    Connecting,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
}

/// Fine-grained connection state reported by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailedState {
    Idle,
    Scanning,
    Connecting,
    Authenticating,
    ObtainingIpaddr,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
    Failed,
    Blocked,
    VerifyingPoorLink,
}

impl DetailedState {
    pub fn state(self) -> State {
        match self {
            DetailedState::Idle | DetailedState::Scanning => State::Disconnected,
            DetailedState::Connecting
            | DetailedState::Authenticating
            | DetailedState::ObtainingIpaddr
            | DetailedState::VerifyingPoorLink => State::Connecting,
            DetailedState::Connected => State::Connected,
            DetailedState::Suspended => State::Suspended,
            DetailedState::Disconnecting => State::Disconnecting,
            DetailedState::Disconnected | DetailedState::Failed | DetailedState::Blocked => {
                State::Disconnected
            }
        }
    }
}

/// Snapshot of one network's state as reported by its tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_type: NetworkType,
    pub subtype: i32,
    pub subtype_name: String,
    pub state: State,
    pub detailed_state: DetailedState,
    pub reason: Option<String>,
    pub extra_info: Option<String>,
    pub is_failover: bool,
    pub is_available: bool,
    pub is_roaming: bool,
}

impl NetworkInfo {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            network_type,
            subtype: 0,
            subtype_name: String::new(),
            state: State::Unknown,
            detailed_state: DetailedState::Idle,
            reason: None,
            extra_info: None,
            is_failover: false,
            is_available: false,
            is_roaming: false,
        }
    }

    pub fn set_detailed_state(
        &mut self,
        detailed: DetailedState,
        reason: Option<String>,
        extra_info: Option<String>,
    ) {
        self.detailed_state = detailed;
        self.state = detailed.state();
        self.reason = reason;
        self.extra_info = extra_info;
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(self.state, State::Connected | State::Connecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_type_parses_names_and_numbers() {
        assert_eq!("wifi".parse::<NetworkType>().unwrap(), NetworkType::WIFI);
        assert_eq!(
            " MOBILE_MMS ".parse::<NetworkType>().unwrap(),
            NetworkType::MOBILE_MMS
        );
        assert_eq!("9".parse::<NetworkType>().unwrap(), NetworkType::ETHERNET);
        assert!("42".parse::<NetworkType>().is_err());
        assert!("token_ring".parse::<NetworkType>().is_err());
    }

    #[test]
    fn mobile_family_excludes_other_radios() {
        assert!(NetworkType::MOBILE_HIPRI.is_mobile());
        assert!(!NetworkType::WIFI.is_mobile());
        assert!(!NetworkType::WIMAX.is_mobile());
    }

    #[test]
    fn detailed_state_drives_coarse_state() {
        let mut info = NetworkInfo::new(NetworkType::WIFI);
        info.set_detailed_state(DetailedState::ObtainingIpaddr, None, None);
        assert!(info.is_connected_or_connecting());
        assert!(!info.is_connected());

        info.set_detailed_state(DetailedState::Failed, Some("dhcp".into()), None);
        assert_eq!(info.state, State::Disconnected);
        assert_eq!(info.reason.as_deref(), Some("dhcp"));
    }
}
