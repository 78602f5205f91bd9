use thiserror::Error;

/// Error type for every netpilot-netlink operation.
///
/// Each variant names the operation, the interface or table involved and the
/// kernel's reason, so a log line is enough to reproduce the failure with `ip`.
#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("Interface '{name}' not found. Verify interface exists with 'ip link show'.")]
    InterfaceNotFound { name: String },

    #[error("Failed to get interface index for '{interface}': {reason}")]
    InterfaceIndexError { interface: String, reason: String },

    #[error("Failed to add route to {destination} via {gateway} on '{interface}': {reason}")]
    AddRouteError {
        destination: String,
        gateway: String,
        interface: String,
        reason: String,
    },

    #[error("Failed to delete route to {destination} on '{interface}': {reason}")]
    DeleteRouteError {
        destination: String,
        interface: String,
        reason: String,
    },

    #[error("Failed to list routes: {reason}")]
    ListRoutesError { reason: String },

    #[error("Failed to {operation} rule from {source_addr} to table {table}: {reason}")]
    RuleError {
        operation: String,
        source_addr: String,
        table: u32,
        reason: String,
    },

    #[error("Invalid argument: {parameter} = '{value}': {reason}")]
    InvalidArgument {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Permission denied: {operation}. Root privileges required.")]
    PermissionDenied { operation: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {what}: {reason}")]
    ParseError { what: String, reason: String },

    #[error("Runtime error: {context}: {reason}")]
    Runtime { context: String, reason: String },
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

impl NetlinkError {
    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied {
                operation: operation.into(),
            };
        }
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn runtime(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseError {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn empty_interface() -> Self {
        Self::InvalidArgument {
            parameter: "interface name".to_string(),
            value: "".to_string(),
            reason: "Interface name cannot be empty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_io_is_reported_as_such() {
        let err = NetlinkError::io_error(
            "writing /proc/sys/net/ipv4/tcp_rmem",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, NetlinkError::PermissionDenied { .. }));

        let err = NetlinkError::io_error(
            "writing resolv.conf",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, NetlinkError::Io { .. }));
    }
}
