use std::path::PathBuf;

use thiserror::Error;

use crate::types::NetworkType;

/// Errors surfaced by the connectivity core.
///
/// Kernel and tracker failures never appear here: those are logged at the call
/// site and the reconciliation carries on. What remains is invalid input from
/// API callers and configuration problems detected at load time.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid network type {0}")]
    InvalidNetworkType(i64),

    #[error("Unknown network name '{0}'")]
    UnknownNetworkName(String),

    #[error("Network type {0} is not configured on this device")]
    NetworkNotConfigured(NetworkType),

    #[error("No interface name for {0}")]
    MissingInterface(String),

    #[error("Route resolution for {route} exceeded recursion cap of {cap}")]
    RouteRecursion { route: String, cap: u32 },

    #[error("Invalid {what} attribute '{entry}': {reason}")]
    InvalidAttribute {
        what: &'static str,
        entry: String,
        reason: String,
    },

    #[error("Invalid argument: {parameter} = '{value}': {reason}")]
    InvalidArgument {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connectivity service is not running")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn invalid_argument(
        parameter: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    fn attribute(what: &'static str, entry: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            what,
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn network_attribute(entry: &str, reason: impl Into<String>) -> Self {
        Self::attribute("network", entry, reason)
    }

    pub(crate) fn radio_attribute(entry: &str, reason: impl Into<String>) -> Self {
        Self::attribute("radio", entry, reason)
    }
}
