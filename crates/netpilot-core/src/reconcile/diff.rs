use std::net::IpAddr;

use crate::link::{CompareResult, LinkAddress, LinkProperties, RouteInfo};
use crate::netd::ResetMask;

/// Three-way diff between the stored and the newly reported link properties.
/// `None` on the old side means "was disconnected", on the new side
/// "is disconnecting".
#[derive(Debug, Clone, Default)]
pub struct LinkDiff {
    pub routes: CompareResult<RouteInfo>,
    pub dns: CompareResult<IpAddr>,
    pub addresses: CompareResult<LinkAddress>,
}

impl LinkDiff {
    pub fn between(cur: Option<&LinkProperties>, new: Option<&LinkProperties>) -> Self {
        Self {
            routes: LinkProperties::compare_routes(cur, new),
            dns: LinkProperties::compare_dns(cur, new),
            addresses: LinkProperties::compare_addresses(cur, new),
        }
    }

    pub fn routes_changed(&self) -> bool {
        !self.routes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.dns.is_empty() && self.addresses.is_empty()
    }
}

/// Sockets to reset for a connected link whose properties moved from `cur`
/// to `new`: everything on an interface change, otherwise only the families
/// that lost an address.
pub fn reset_mask(cur: Option<&LinkProperties>, new: &LinkProperties) -> ResetMask {
    let Some(cur) = cur else {
        return ResetMask::NONE;
    };
    if !cur.is_identical_interface_name(new) {
        return ResetMask::ALL;
    }
    LinkProperties::compare_addresses(Some(cur), Some(new))
        .removed
        .iter()
        .fold(ResetMask::NONE, |mask, addr| {
            mask | ResetMask::for_address(&addr.address)
        })
}
