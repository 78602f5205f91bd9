//! One row per configured network type, replacing parallel per-type arrays.

use serde::{Deserialize, Serialize};

use crate::config::{NetworkConfig, NetworkTable};
use crate::link::{LinkProperties, RouteInfo};
use crate::types::NetworkType;

/// Base of the per-type secondary routing tables.
pub const SECONDARY_TABLE_BASE: u32 = 100;

/// Where a network's routes go: its secondary/source table and, in dual
/// mode, the metric its default route carries in the main table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAttributes {
    pub table_id: u32,
    pub metric: Option<u32>,
}

impl RouteAttributes {
    pub fn for_type(network_type: NetworkType) -> Self {
        Self {
            table_id: SECONDARY_TABLE_BASE + u32::from(network_type.raw()),
            metric: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkRow {
    pub config: NetworkConfig,
    /// Link properties as of the last completed reconciliation.
    pub current_lp: Option<LinkProperties>,
    pub attrs: RouteAttributes,
    /// A failover reconnect was issued for this type and it has not yet
    /// reported back.
    pub failover_pending: bool,
    /// Host routes installed by request-route-to-host with the requesting
    /// pid, released on disconnect or when that pid exits.
    pub host_routes: Vec<(u32, RouteInfo)>,
}

impl NetworkRow {
    fn new(config: NetworkConfig) -> Self {
        let attrs = RouteAttributes::for_type(config.network_type);
        Self {
            config,
            current_lp: None,
            attrs,
            failover_pending: false,
            host_routes: Vec::new(),
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.config.network_type
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    rows: Vec<Option<NetworkRow>>,
}

impl Registry {
    pub fn new(table: &NetworkTable) -> Self {
        let mut rows = vec![None; NetworkType::MAX.index() + 1];
        for config in table.configs() {
            rows[config.network_type.index()] = Some(NetworkRow::new(config.clone()));
        }
        Self { rows }
    }

    pub fn get(&self, network_type: NetworkType) -> Option<&NetworkRow> {
        self.rows.get(network_type.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, network_type: NetworkType) -> Option<&mut NetworkRow> {
        self.rows.get_mut(network_type.index()).and_then(Option::as_mut)
    }

    pub fn current_lp(&self, network_type: NetworkType) -> Option<&LinkProperties> {
        self.get(network_type).and_then(|row| row.current_lp.as_ref())
    }

    pub fn attrs(&self, network_type: NetworkType) -> Option<RouteAttributes> {
        self.get(network_type).map(|row| row.attrs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkRow> {
        self.rows.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_exist_only_for_configured_types() {
        let table = NetworkTable::parse(
            &[
                "wifi,1,1,1,-1,true".to_string(),
                "mobile,0,0,2,-1,true".to_string(),
            ],
            &["1,1".to_string(), "0,7".to_string()],
        );
        let registry = Registry::new(&table);
        assert!(registry.get(NetworkType::WIFI).is_some());
        assert!(registry.get(NetworkType::ETHERNET).is_none());
        assert_eq!(registry.iter().count(), 2);
        assert_eq!(registry.attrs(NetworkType::WIFI).unwrap().table_id, 101);
    }
}
