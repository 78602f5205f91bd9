//! # netpilot-netlink
//!
//! Kernel side of the connectivity service: routes and source rules through
//! rtnetlink, interface addresses, link/address/route change events, the
//! resolver file, and TCP buffer sysctls.
//!
//! Linux-only. The rtnetlink modules are gated with `#[cfg(target_os = "linux")]`.
//! Managers spawn their netlink connection on the current tokio runtime, so
//! construct them inside one.

#[cfg(target_os = "linux")]
pub mod address;
pub mod error;
#[cfg(target_os = "linux")]
pub mod events;
pub mod resolver;
#[cfg(target_os = "linux")]
pub mod route;
#[cfg(target_os = "linux")]
pub mod rule;
pub mod sysctl;

#[cfg(target_os = "linux")]
pub use address::{list_addresses, InterfaceAddress};
pub use error::{NetlinkError, Result};
#[cfg(target_os = "linux")]
pub use events::NetlinkEvent;
pub use resolver::ResolverWriter;
#[cfg(target_os = "linux")]
pub use route::{RouteEntry, RouteManager, RouteSpec, MAIN_TABLE};
#[cfg(target_os = "linux")]
pub use rule::RuleManager;
pub use sysctl::{set_tcp_buffer_sizes, TcpBufferSizes};

#[cfg(target_os = "linux")]
pub async fn list_routes() -> Result<Vec<RouteEntry>> {
    let mgr = RouteManager::new()?;
    mgr.list_routes().await
}
