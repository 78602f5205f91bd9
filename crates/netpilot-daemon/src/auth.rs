use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;

use tokio::net::UnixStream;
use tracing::debug;

use netpilot_ipc::{AuthorizationTier, Endpoint};

use crate::config::DaemonConfig;

#[derive(Debug, Clone, Copy)]
pub struct PeerCred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCred> {
    let fd = stream.as_raw_fd();
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(PeerCred {
        pid: cred.pid as u32,
        uid: cred.uid,
        gid: cred.gid,
    })
}

/// uid 0 and members of `admin_group` are Admin, members of
/// `operator_group` are Operator, everyone else is ReadOnly.
pub fn authorization_for_peer(peer: &PeerCred, config: &DaemonConfig) -> AuthorizationTier {
    if peer.uid == 0 {
        return AuthorizationTier::Admin;
    }

    match read_supplementary_groups(peer) {
        Ok(group_names) => {
            debug!(
                "peer pid {} uid {} groups: {:?}",
                peer.pid, peer.uid, group_names
            );
            tier_for_groups(&group_names, config)
        }
        Err(err) => {
            debug!(
                "failed to read groups for pid {} uid {}: {}",
                peer.pid, peer.uid, err
            );
            // Fail closed.
            AuthorizationTier::ReadOnly
        }
    }
}

fn tier_for_groups(group_names: &[String], config: &DaemonConfig) -> AuthorizationTier {
    if group_names.contains(&config.admin_group) {
        AuthorizationTier::Admin
    } else if group_names.contains(&config.operator_group) {
        AuthorizationTier::Operator
    } else {
        AuthorizationTier::ReadOnly
    }
}

fn read_supplementary_groups(peer: &PeerCred) -> io::Result<Vec<String>> {
    let status = fs::read_to_string(format!("/proc/{}/status", peer.pid))?;
    let gids = groups_from_status(&status, peer.uid)?;
    let map = parse_group_file(&fs::read_to_string("/etc/group")?);
    Ok(gids
        .into_iter()
        .filter_map(|gid| map.get(&gid).cloned())
        .collect())
}

/// GIDs on the `Groups:` line, after checking the real uid on `Uid:` matches
/// the kernel-provided peer credential.
fn groups_from_status(status: &str, expected_uid: u32) -> io::Result<Vec<u32>> {
    let uid_line = status
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Uid line not found"))?;
    let real_uid = uid_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Uid parse failed"))?;
    if real_uid != expected_uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "pid uid mismatch",
        ));
    }

    let groups_line = status
        .lines()
        .find(|line| line.starts_with("Groups:"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Groups line not found"))?;
    Ok(groups_line
        .trim_start_matches("Groups:")
        .split_whitespace()
        .filter_map(|s| s.parse::<u32>().ok())
        .collect())
}

/// `groupname:x:gid:members`
fn parse_group_file(content: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split(':');
        let Some(name) = parts.next() else {
            continue;
        };
        let gid = parts.nth(1).and_then(|s| s.parse::<u32>().ok());
        if let Some(gid) = gid {
            map.insert(gid, name.to_string());
        }
    }
    map
}

pub fn required_tier(endpoint: Endpoint) -> AuthorizationTier {
    match endpoint {
        Endpoint::Health
        | Endpoint::Version
        | Endpoint::Status
        | Endpoint::SnapshotGet
        | Endpoint::ActiveNetworkInfoGet
        | Endpoint::NetworkInfoGet
        | Endpoint::AllNetworkInfoGet
        | Endpoint::ActiveLinkPropertiesGet
        | Endpoint::LinkPropertiesGet
        | Endpoint::ActiveNetworkMeteredGet
        | Endpoint::NetworkSupportedGet
        | Endpoint::NetworkPreferenceGet
        | Endpoint::FeatureUsersList
        | Endpoint::MobileDataGet
        | Endpoint::WakelockStatusGet
        | Endpoint::GlobalProxyGet
        | Endpoint::ProxyGet
        | Endpoint::UidRuleGet
        | Endpoint::FmcStatusGet
        | Endpoint::DnsGet
        | Endpoint::BroadcastsRecent
        | Endpoint::KernelRoutesList
        | Endpoint::LoggingConfigGet => AuthorizationTier::ReadOnly,

        // Feature users are keyed by the caller's own pid.
        Endpoint::FeatureStart
        | Endpoint::FeatureStop
        | Endpoint::RouteToHostRequest
        | Endpoint::InetConditionReport => AuthorizationTier::Operator,

        Endpoint::NetworkPreferenceSet
        | Endpoint::MobileDataSet
        | Endpoint::PolicyDataEnableSet
        | Endpoint::DataDependencySet
        | Endpoint::RadiosSet
        | Endpoint::RadioSet
        | Endpoint::GlobalProxySet
        | Endpoint::UidRuleSet
        | Endpoint::ReprioritizeDns
        | Endpoint::ProcessDied
        | Endpoint::DnsOverrideSet
        | Endpoint::DnsRestore
        | Endpoint::SettingsReload => AuthorizationTier::Operator,

        Endpoint::WakelockRequest
        | Endpoint::FmcStart
        | Endpoint::FmcStop
        | Endpoint::SwitchConnectivity
        | Endpoint::LoggingConfigSet => AuthorizationTier::Admin,
    }
}

pub fn tier_allows(actual: AuthorizationTier, required: AuthorizationTier) -> bool {
    actual.allows(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tnetpilotctl\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\nGroups:\t4 27 1001 \n";
    const GROUP: &str = "root:x:0:\nadm:x:4:alice\nsudo:x:27:alice\nnetpilot:x:1001:alice\nbroken-line\n";

    #[test]
    fn groups_resolve_through_the_group_file() {
        let gids = groups_from_status(STATUS, 1000).unwrap();
        assert_eq!(gids, vec![4, 27, 1001]);
        let map = parse_group_file(GROUP);
        assert_eq!(map.get(&1001).map(String::as_str), Some("netpilot"));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn uid_mismatch_fails_closed() {
        let err = groups_from_status(STATUS, 1001).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn operator_group_grants_operator() {
        let config = DaemonConfig::from_env();
        let names = vec!["adm".to_string(), config.operator_group.clone()];
        assert_eq!(tier_for_groups(&names, &config), AuthorizationTier::Operator);
        let names = vec![config.admin_group.clone(), config.operator_group.clone()];
        assert_eq!(tier_for_groups(&names, &config), AuthorizationTier::Admin);
        assert_eq!(
            tier_for_groups(&["users".to_string()], &config),
            AuthorizationTier::ReadOnly
        );
    }

    #[test]
    fn mutating_endpoints_need_operator() {
        assert_eq!(required_tier(Endpoint::Status), AuthorizationTier::ReadOnly);
        assert_eq!(
            required_tier(Endpoint::NetworkPreferenceSet),
            AuthorizationTier::Operator
        );
        assert_eq!(required_tier(Endpoint::FeatureStart), AuthorizationTier::Operator);
    }

    #[test]
    fn transitions_need_admin() {
        for endpoint in [
            Endpoint::WakelockRequest,
            Endpoint::FmcStart,
            Endpoint::FmcStop,
            Endpoint::SwitchConnectivity,
        ] {
            assert_eq!(required_tier(endpoint), AuthorizationTier::Admin);
        }
        assert!(!tier_allows(
            AuthorizationTier::Operator,
            required_tier(Endpoint::SwitchConnectivity)
        ));
    }
}
