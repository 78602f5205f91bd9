//! Link, address and route change notifications from the rtnetlink
//! multicast groups.

use crate::error::{NetlinkError, Result};
use futures::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::new_connection;
use tokio::sync::mpsc;
use tracing::debug;

const GROUPS: u32 = (libc::RTMGRP_LINK
    | libc::RTMGRP_IPV4_IFADDR
    | libc::RTMGRP_IPV6_IFADDR
    | libc::RTMGRP_IPV4_ROUTE
    | libc::RTMGRP_IPV6_ROUTE) as u32;

/// One kernel notification, reduced to what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetlinkEvent {
    /// Link added, removed or changed state; carries the interface index.
    Link(u32),
    Address(u32),
    Route,
}

pub fn classify(message: &RouteNetlinkMessage) -> Option<NetlinkEvent> {
    match message {
        RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
            Some(NetlinkEvent::Link(link.header.index))
        }
        RouteNetlinkMessage::NewAddress(addr) | RouteNetlinkMessage::DelAddress(addr) => {
            Some(NetlinkEvent::Address(addr.header.index))
        }
        RouteNetlinkMessage::NewRoute(_) | RouteNetlinkMessage::DelRoute(_) => {
            Some(NetlinkEvent::Route)
        }
        _ => None,
    }
}

/// Joins the link, address and route groups and forwards every change.
///
/// The returned channel closes when the netlink socket does. Must be called
/// inside a tokio runtime.
pub fn subscribe() -> Result<mpsc::UnboundedReceiver<NetlinkEvent>> {
    let (mut connection, handle, mut messages) = new_connection().map_err(|e| {
        NetlinkError::runtime("creating netlink connection for events", e.to_string())
    })?;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, GROUPS))
        .map_err(|e| NetlinkError::io_error("binding rtnetlink multicast groups", e))?;
    tokio::spawn(connection);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _handle = handle;
        while let Some((message, _)) = messages.next().await {
            let NetlinkPayload::InnerMessage(inner) = message.payload else {
                continue;
            };
            let Some(event) = classify(&inner) else {
                continue;
            };
            if tx.send(event).is_err() {
                break;
            }
        }
        debug!(target: "net", "Netlink event stream ended");
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::address::AddressMessage;
    use netlink_packet_route::link::LinkMessage;
    use netlink_packet_route::route::RouteMessage;

    #[test]
    fn classifies_link_address_and_route_changes() {
        let mut link = LinkMessage::default();
        link.header.index = 4;
        assert_eq!(
            classify(&RouteNetlinkMessage::DelLink(link)),
            Some(NetlinkEvent::Link(4))
        );

        let mut addr = AddressMessage::default();
        addr.header.index = 7;
        assert_eq!(
            classify(&RouteNetlinkMessage::NewAddress(addr)),
            Some(NetlinkEvent::Address(7))
        );

        assert_eq!(
            classify(&RouteNetlinkMessage::NewRoute(RouteMessage::default())),
            Some(NetlinkEvent::Route)
        );
    }
}
