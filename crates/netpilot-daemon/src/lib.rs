//! netpilotd: hosts the connectivity service and exposes it on a Unix socket.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod monitor;
pub mod netd;
pub mod reaper;
pub mod server;
pub mod settings_watch;
pub mod socket;
pub mod state;
pub mod tracker;
