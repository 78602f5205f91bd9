//! Interface addresses read back from the kernel.

use crate::error::{NetlinkError, Result};
use futures::stream::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::new_connection;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    /// Link-local and loopback addresses never carry traffic for a network.
    pub fn is_routable(&self) -> bool {
        match self.address {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(v6) => {
                !v6.is_loopback()
                    && !v6.is_unspecified()
                    && (v6.segments()[0] & 0xffc0) != 0xfe80
            }
        }
    }
}

/// Addresses assigned to the interface with kernel index `index`.
pub async fn list_addresses(index: u32) -> Result<Vec<InterfaceAddress>> {
    let (connection, handle, _) = new_connection().map_err(|e| {
        NetlinkError::runtime("creating netlink connection for address dump", e.to_string())
    })?;
    tokio::spawn(connection);

    let mut messages = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    let mut addresses = Vec::new();
    while let Some(message) = messages.try_next().await.map_err(|e| {
        NetlinkError::runtime(
            format!("listing addresses for interface index {}", index),
            e.to_string(),
        )
    })? {
        for nla in &message.attributes {
            if let AddressAttribute::Address(ip) = nla {
                addresses.push(InterfaceAddress {
                    address: *ip,
                    prefix_len: message.header.prefix_len,
                });
            }
        }
    }
    Ok(addresses)
}
