//! Client side of the netpilotd control socket.

pub mod cli;
mod client;

pub use client::{ClientConfig, DaemonClient, DaemonClientInfo};
