use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::types::NetworkType;

pub const CONFIG_FILENAME: &str = "netpilot.json";
pub const DEFAULT_INET_CONDITION_DEBOUNCE_UP_MS: u64 = 500;
pub const DEFAULT_INET_CONDITION_DEBOUNCE_DOWN_MS: u64 = 3000;
pub const DEFAULT_ROUTE_RECURSION_CAP: u32 = 10;
pub const DEFAULT_WAKELOCK_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECTIVITY_CHANGE_DELAY_MS: u64 = 3000;
pub const DEFAULT_DNS_SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
pub const DEFAULT_DUAL_PREFERRED_METRIC: u32 = 0;
pub const DEFAULT_DUAL_OTHER_METRIC: u32 = 10;

/// Which branch of the state machine runs under the root state. Smart and FMC
/// are never active together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    #[default]
    Single,
    Smart,
    Fmc,
}

/// Static per-type configuration, parsed from
/// `name,type,radio,priority,restoreTimeMs,dependencyMet[,metered]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConfig {
    pub name: String,
    pub network_type: NetworkType,
    pub radio: NetworkType,
    /// Lower value wins.
    pub priority: i32,
    pub restore_time: Option<Duration>,
    pub dependency_met: bool,
    pub metered: bool,
}

impl NetworkConfig {
    pub fn parse(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
        if fields.len() < 6 || fields.len() > 7 {
            return Err(CoreError::network_attribute(
                entry,
                format!("expected 6 or 7 fields, got {}", fields.len()),
            ));
        }

        let parse_type = |raw: &str| -> Result<NetworkType> {
            let value = raw
                .parse::<i64>()
                .map_err(|e| CoreError::network_attribute(entry, e.to_string()))?;
            NetworkType::from_i64(value)
        };
        let parse_bool = |raw: &str| -> Result<bool> {
            raw.parse::<bool>()
                .map_err(|e| CoreError::network_attribute(entry, e.to_string()))
        };

        let name = fields[0].to_string();
        if name.is_empty() {
            return Err(CoreError::network_attribute(entry, "empty name"));
        }
        let network_type = parse_type(fields[1])?;
        let radio = parse_type(fields[2])?;
        let priority = fields[3]
            .parse::<i32>()
            .map_err(|e| CoreError::network_attribute(entry, e.to_string()))?;
        let restore_ms = fields[4]
            .parse::<i64>()
            .map_err(|e| CoreError::network_attribute(entry, e.to_string()))?;
        let restore_time = (restore_ms > 0).then(|| Duration::from_millis(restore_ms as u64));
        let dependency_met = parse_bool(fields[5])?;
        let metered = match fields.get(6) {
            Some(raw) => parse_bool(raw)?,
            None => network_type.is_mobile(),
        };

        Ok(Self {
            name,
            network_type,
            radio,
            priority,
            restore_time,
            dependency_met,
            metered,
        })
    }

    /// A network is a default network when it is its radio's primary type.
    pub fn is_default(&self) -> bool {
        self.network_type == self.radio
    }
}

/// Radio declaration parsed from `radio,simultaneity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RadioAttributes {
    pub radio: NetworkType,
    pub simultaneity: u32,
}

impl RadioAttributes {
    pub fn parse(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
        if fields.len() != 2 {
            return Err(CoreError::radio_attribute(
                entry,
                format!("expected 2 fields, got {}", fields.len()),
            ));
        }
        let radio = fields[0]
            .parse::<i64>()
            .map_err(|e| CoreError::radio_attribute(entry, e.to_string()))
            .and_then(NetworkType::from_i64)?;
        let simultaneity = fields[1]
            .parse::<u32>()
            .map_err(|e| CoreError::radio_attribute(entry, e.to_string()))?;
        Ok(Self {
            radio,
            simultaneity,
        })
    }
}

/// Immutable network table, indexed by network type.
#[derive(Debug, Clone)]
pub struct NetworkTable {
    configs: Vec<Option<NetworkConfig>>,
    radios: Vec<Option<RadioAttributes>>,
    priority_order: Vec<NetworkType>,
}

impl NetworkTable {
    /// Bad entries are skipped with a warning; the rest still load.
    pub fn parse(networks: &[String], radios: &[String]) -> Self {
        let slots = NetworkType::MAX.index() + 1;
        let mut radio_table: Vec<Option<RadioAttributes>> = vec![None; slots];
        for entry in radios {
            match RadioAttributes::parse(entry) {
                Ok(radio) if radio_table[radio.radio.index()].is_some() => {
                    warn!("Ignoring duplicate radio {} in '{}'", radio.radio, entry);
                }
                Ok(radio) => radio_table[radio.radio.index()] = Some(radio),
                Err(err) => warn!("Skipping radio entry: {}", err),
            }
        }

        let mut configs: Vec<Option<NetworkConfig>> = vec![None; slots];
        for entry in networks {
            let config = match NetworkConfig::parse(entry) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Skipping network entry: {}", err);
                    continue;
                }
            };
            if radio_table[config.radio.index()].is_none() {
                warn!(
                    "Skipping network '{}': radio {} is not declared",
                    config.name, config.radio
                );
                continue;
            }
            let slot = &mut configs[config.network_type.index()];
            if slot.is_some() {
                warn!(
                    "Skipping duplicate definition for network type {}",
                    config.network_type
                );
                continue;
            }
            *slot = Some(config);
        }

        let mut priority_order: Vec<NetworkType> = configs
            .iter()
            .flatten()
            .map(|config| config.network_type)
            .collect();
        priority_order.sort_by_key(|t| {
            configs[t.index()]
                .as_ref()
                .map(|c| c.priority)
                .unwrap_or(i32::MAX)
        });

        Self {
            configs,
            radios: radio_table,
            priority_order,
        }
    }

    pub fn get(&self, network_type: NetworkType) -> Option<&NetworkConfig> {
        self.configs.get(network_type.index()).and_then(Option::as_ref)
    }

    pub fn radio(&self, radio: NetworkType) -> Option<&RadioAttributes> {
        self.radios.get(radio.index()).and_then(Option::as_ref)
    }

    pub fn is_configured(&self, network_type: NetworkType) -> bool {
        self.get(network_type).is_some()
    }

    pub fn is_default(&self, network_type: NetworkType) -> bool {
        self.get(network_type).map_or(false, NetworkConfig::is_default)
    }

    pub fn priority(&self, network_type: NetworkType) -> Option<i32> {
        self.get(network_type).map(|c| c.priority)
    }

    /// Configured types, best priority first.
    pub fn priority_order(&self) -> &[NetworkType] {
        &self.priority_order
    }

    pub fn configs(&self) -> impl Iterator<Item = &NetworkConfig> {
        self.configs.iter().flatten()
    }
}

/// Tunables for the connectivity core, loaded from `netpilot.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub networks: Vec<String>,
    pub radios: Vec<String>,
    pub variant: Variant,
    pub default_network_preference: NetworkType,
    pub inet_condition_debounce_up_ms: u64,
    pub inet_condition_debounce_down_ms: u64,
    pub route_recursion_cap: u32,
    pub wakelock_timeout_ms: u64,
    pub connectivity_change_delay_ms: u64,
    pub default_dns_server: IpAddr,
    pub dual_preferred_metric: u32,
    pub dual_other_metric: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            networks: [
                "wifi,1,1,1,-1,true",
                "mobile,0,0,2,-1,true",
                "mobile_mms,2,0,3,60000,true",
                "mobile_supl,3,0,3,60000,true",
                "mobile_dun,4,0,4,60000,true",
                "mobile_hipri,5,0,3,60000,true",
                "mobile_fota,10,0,3,60000,true",
                "mobile_ims,11,0,3,-1,true",
                "mobile_cbs,12,0,3,60000,true",
                "bluetooth,7,7,1,-1,true",
                "ethernet,9,9,0,-1,true",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            radios: ["1,1", "0,7", "7,1", "9,1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            variant: Variant::Single,
            default_network_preference: NetworkType::WIFI,
            inet_condition_debounce_up_ms: DEFAULT_INET_CONDITION_DEBOUNCE_UP_MS,
            inet_condition_debounce_down_ms: DEFAULT_INET_CONDITION_DEBOUNCE_DOWN_MS,
            route_recursion_cap: DEFAULT_ROUTE_RECURSION_CAP,
            wakelock_timeout_ms: DEFAULT_WAKELOCK_TIMEOUT_MS,
            connectivity_change_delay_ms: DEFAULT_CONNECTIVITY_CHANGE_DELAY_MS,
            default_dns_server: DEFAULT_DNS_SERVER,
            dual_preferred_metric: DEFAULT_DUAL_PREFERRED_METRIC,
            dual_other_metric: DEFAULT_DUAL_OTHER_METRIC,
        }
    }
}

impl CoreConfig {
    pub fn config_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILENAME)
    }

    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(CoreError::io(format!("reading {}", path.display()), err));
            }
        };
        serde_json::from_str(&contents).map_err(|e| CoreError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn network_table(&self) -> NetworkTable {
        NetworkTable::parse(&self.networks, &self.radios)
    }

    pub fn debounce_up(&self) -> Duration {
        Duration::from_millis(self.inet_condition_debounce_up_ms)
    }

    pub fn debounce_down(&self) -> Duration {
        Duration::from_millis(self.inet_condition_debounce_down_ms)
    }

    pub fn wakelock_timeout(&self) -> Duration {
        Duration::from_millis(self.wakelock_timeout_ms)
    }

    pub fn connectivity_change_delay(&self) -> Duration {
        Duration::from_millis(self.connectivity_change_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_network_attribute_string() {
        let cfg = NetworkConfig::parse("mobile_mms,2,0,3,60000,true").unwrap();
        assert_eq!(cfg.network_type, NetworkType::MOBILE_MMS);
        assert_eq!(cfg.radio, NetworkType::MOBILE);
        assert_eq!(cfg.restore_time, Some(Duration::from_secs(60)));
        assert!(!cfg.is_default());
        assert!(cfg.metered);

        let wifi = NetworkConfig::parse("wifi,1,1,1,-1,true,false").unwrap();
        assert!(wifi.is_default());
        assert_eq!(wifi.restore_time, None);
        assert!(!wifi.metered);
    }

    #[test]
    fn bad_entries_are_skipped() {
        let table = NetworkTable::parse(
            &strings(&[
                "wifi,1,1,1,-1,true",
                "wifi_again,1,1,5,-1,true",
                "broken",
                "future,42,42,1,-1,true",
                "wimax,6,6,1,-1,true",
                "mobile,0,0,2,-1,maybe",
                "mobile,0,0,2,-1,true",
            ]),
            &strings(&["1,1", "0,7", "nonsense"]),
        );

        assert!(table.is_configured(NetworkType::WIFI));
        assert_eq!(table.get(NetworkType::WIFI).unwrap().name, "wifi");
        // radio 6 was never declared
        assert!(!table.is_configured(NetworkType::WIMAX));
        assert!(table.is_configured(NetworkType::MOBILE));
        assert_eq!(table.configs().count(), 2);
    }

    #[test]
    fn priority_order_is_ascending() {
        let table = CoreConfig::default().network_table();
        let order = table.priority_order();
        assert_eq!(order[0], NetworkType::ETHERNET);
        let priorities: Vec<i32> = order.iter().map(|t| table.priority(*t).unwrap()).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = CoreConfig::load(&CoreConfig::config_path(dir.path())).unwrap();
        assert_eq!(cfg.route_recursion_cap, DEFAULT_ROUTE_RECURSION_CAP);
        assert_eq!(cfg.variant, Variant::Single);
    }

    #[test]
    fn partial_config_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = CoreConfig::config_path(dir.path());
        fs::write(&path, r#"{ "variant": "smart", "inet_condition_debounce_up_ms": 250 }"#)
            .unwrap();

        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.variant, Variant::Smart);
        assert_eq!(cfg.debounce_up(), Duration::from_millis(250));
        assert_eq!(cfg.debounce_down(), Duration::from_millis(3000));
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = CoreConfig::config_path(dir.path());
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CoreConfig::load(&path),
            Err(CoreError::Config { .. })
        ));
    }
}
