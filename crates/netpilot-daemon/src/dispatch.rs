use std::sync::Arc;

use tokio::task;
use tracing::{debug, info};

use netpilot_ipc::{
    AckResponse, BoolResponse, BroadcastsResponse, DaemonError, ErrorCode, FeatureStartResponse,
    FeatureStopResponse, FeatureUsersResponse, FmcStatusResponse, HealthResponse, KernelRoute,
    KernelRoutesResponse, LinkPropertiesResponse, LoggingConfigResponse, NetworkInfoListResponse,
    NetworkInfoResponse, PreferenceResponse, ProxyResponse, RequestBody, RequestEnvelope,
    ResponseBody, ResponseEnvelope, ResponseOk, StatusResponse, UidRuleResponse, VersionResponse,
    PROTOCOL_VERSION,
};
use netpilot_logging::LoggingConfig;

use crate::auth::PeerCred;
use crate::state::DaemonState;

/// Upper bound on `BroadcastsRecent` regardless of what the caller asks for.
const MAX_BROADCASTS: usize = 1024;

async fn run_blocking<T, E, F>(label: &'static str, f: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    E: Into<DaemonError> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| {
            DaemonError::new(ErrorCode::Internal, format!("{} panicked", label), false)
                .with_detail(e.to_string())
                .with_source(format!("daemon.dispatch.{}", label))
        })?
        .map_err(|e| e.into())
}

fn io_error(label: &'static str, err: anyhow::Error) -> DaemonError {
    DaemonError::new(ErrorCode::Io, format!("{} failed", label), false)
        .with_detail(format!("{:#}", err))
        .with_source(format!("daemon.dispatch.{}", label))
}

pub async fn handle_request(
    state: &Arc<DaemonState>,
    request: RequestEnvelope,
    peer: PeerCred,
) -> ResponseEnvelope {
    let request_id = request.request_id;
    let body = match dispatch(state, request.body, peer).await {
        Ok(ok) => ResponseBody::Ok(ok),
        Err(err) => {
            debug!(code = ?err.code, "Request failed: {}", err);
            ResponseBody::Err(err)
        }
    };
    ResponseEnvelope {
        v: PROTOCOL_VERSION,
        request_id,
        body,
    }
}

fn ack(message: impl Into<String>) -> Result<ResponseOk, DaemonError> {
    Ok(ResponseOk::Ack(AckResponse::new(message)))
}

fn boolean(value: bool) -> Result<ResponseOk, DaemonError> {
    Ok(ResponseOk::Bool(BoolResponse { value }))
}

async fn dispatch(
    state: &Arc<DaemonState>,
    body: RequestBody,
    peer: PeerCred,
) -> Result<ResponseOk, DaemonError> {
    let service = &state.service;
    match body {
        RequestBody::Health => Ok(ResponseOk::Health(HealthResponse {
            ok: true,
            uptime_ms: state.uptime_ms(),
            message: "ok".to_string(),
        })),
        RequestBody::Version => Ok(ResponseOk::Version(VersionResponse {
            daemon_version: state.version.clone(),
            protocol_version: PROTOCOL_VERSION,
        })),
        RequestBody::Status => {
            let snapshot = service.snapshot();
            Ok(ResponseOk::Status(StatusResponse {
                uptime_ms: state.uptime_ms(),
                variant: state.variant,
                state: snapshot.state,
                active_default: snapshot.active_default,
                network_preference: snapshot.network_preference,
                trackers: state.tracker_names(),
            }))
        }
        RequestBody::SnapshotGet => Ok(ResponseOk::Snapshot(Box::new(service.snapshot()))),
        RequestBody::ActiveNetworkInfoGet => Ok(ResponseOk::NetworkInfo(NetworkInfoResponse {
            info: service.active_network_info(peer.uid),
        })),
        RequestBody::NetworkInfoGet(req) => Ok(ResponseOk::NetworkInfo(NetworkInfoResponse {
            info: service.network_info(req.network_type, peer.uid)?,
        })),
        RequestBody::AllNetworkInfoGet => Ok(ResponseOk::NetworkInfoList(NetworkInfoListResponse {
            networks: service.all_network_info(peer.uid),
        })),
        RequestBody::ActiveLinkPropertiesGet => {
            Ok(ResponseOk::LinkProperties(LinkPropertiesResponse {
                link: service.active_link_properties(),
            }))
        }
        RequestBody::LinkPropertiesGet(req) => {
            Ok(ResponseOk::LinkProperties(LinkPropertiesResponse {
                link: service.link_properties(req.network_type)?,
            }))
        }
        RequestBody::ActiveNetworkMeteredGet => boolean(service.is_active_network_metered()),
        RequestBody::NetworkSupportedGet(req) => {
            boolean(service.is_network_supported(req.network_type))
        }
        RequestBody::NetworkPreferenceGet => Ok(ResponseOk::Preference(PreferenceResponse {
            network_type: service.network_preference(),
        })),
        RequestBody::NetworkPreferenceSet(req) => {
            service.set_network_preference(req.network_type)?;
            info!("Network preference set to {} by uid {}", req.network_type, peer.uid);
            ack("network preference queued")
        }
        RequestBody::FeatureStart(req) => {
            let result = service.start_using_network_feature(
                req.network_type,
                &req.feature,
                peer.pid,
                peer.uid,
            )?;
            Ok(ResponseOk::FeatureStarted(FeatureStartResponse {
                result,
                code: result.code(),
            }))
        }
        RequestBody::FeatureStop(req) => {
            let result = service.stop_using_network_feature(
                req.network_type,
                &req.feature,
                peer.pid,
                peer.uid,
            )?;
            Ok(ResponseOk::FeatureStopped(FeatureStopResponse { result }))
        }
        RequestBody::FeatureUsersList => Ok(ResponseOk::FeatureUsers(FeatureUsersResponse {
            users: service.feature_users(),
        })),
        RequestBody::RouteToHostRequest(req) => {
            let service = service.clone();
            let added = run_blocking("route_to_host", move || {
                service.request_route_to_host_address(req.network_type, req.address, peer.pid)
            })
            .await?;
            boolean(added)
        }
        RequestBody::MobileDataGet => boolean(service.mobile_data_enabled()),
        RequestBody::MobileDataSet(req) => {
            service.set_mobile_data_enabled(req.enabled)?;
            ack("mobile data change queued")
        }
        RequestBody::PolicyDataEnableSet(req) => {
            service.set_policy_data_enable(req.network_type, req.enabled)?;
            ack("policy data change queued")
        }
        RequestBody::InetConditionReport(req) => {
            service.report_inet_condition(req.network_type, req.percentage)?;
            ack("inet condition queued")
        }
        RequestBody::DataDependencySet(req) => {
            service.set_data_dependency(req.network_type, req.met)?;
            ack("data dependency queued")
        }
        RequestBody::WakelockRequest(req) => {
            boolean(service.request_network_transition_wakelock(&req.for_what)?)
        }
        RequestBody::WakelockStatusGet => Ok(ResponseOk::Wakelock(service.wakelock_status())),
        RequestBody::RadiosSet(req) => boolean(service.set_radios(req.on)),
        RequestBody::RadioSet(req) => boolean(service.set_radio(req.network_type, req.on)?),
        RequestBody::GlobalProxyGet => Ok(ResponseOk::Proxy(ProxyResponse {
            proxy: service.global_proxy(),
        })),
        RequestBody::GlobalProxySet(req) => {
            service.set_global_proxy(req.proxy)?;
            ack("global proxy queued")
        }
        RequestBody::ProxyGet => Ok(ResponseOk::Proxy(ProxyResponse {
            proxy: service.proxy(),
        })),
        RequestBody::UidRuleGet(req) => Ok(ResponseOk::UidRule(UidRuleResponse {
            uid: req.uid,
            rule: service.uid_rule(req.uid),
        })),
        RequestBody::UidRuleSet(req) => {
            service.set_uid_rule(req.uid, req.rule);
            Ok(ResponseOk::UidRule(UidRuleResponse {
                uid: req.uid,
                rule: req.rule,
            }))
        }
        RequestBody::FmcStart => {
            service.start_fmc()?;
            ack("fmc start queued")
        }
        RequestBody::FmcStop => {
            service.stop_fmc()?;
            ack("fmc stop queued")
        }
        RequestBody::FmcStatusGet => Ok(ResponseOk::Fmc(FmcStatusResponse {
            status: service.fmc_status(),
        })),
        RequestBody::SwitchConnectivity(req) => {
            service.switch_connectivity(req.network_type)?;
            ack("switch queued")
        }
        RequestBody::ReprioritizeDns(req) => {
            service.reprioritize_dns(req.network_type)?;
            ack("dns reprioritization queued")
        }
        RequestBody::ProcessDied(req) => {
            service.process_died(req.pid)?;
            ack("process death queued")
        }
        RequestBody::DnsGet => Ok(ResponseOk::Dns(service.dns())),
        RequestBody::DnsOverrideSet(dns) => {
            service.override_dns(dns)?;
            ack("dns override queued")
        }
        RequestBody::DnsRestore => {
            service.restore_dns()?;
            ack("dns restore queued")
        }
        RequestBody::SettingsReload => {
            service.reload_settings()?;
            ack("settings reload queued")
        }
        RequestBody::BroadcastsRecent(req) => Ok(ResponseOk::Broadcasts(BroadcastsResponse {
            broadcasts: state.broadcasts.recent(req.limit.min(MAX_BROADCASTS)),
        })),
        RequestBody::KernelRoutesList => kernel_routes().await,
        RequestBody::LoggingConfigGet => {
            let root = state.config.root_path.clone();
            let cfg = run_blocking("logging_config_get", move || {
                Ok::<_, DaemonError>(netpilot_logging::fs::read_config(&root))
            })
            .await?;
            Ok(ResponseOk::LoggingConfig(logging_response(&cfg)))
        }
        RequestBody::LoggingConfigSet(req) => {
            let root = state.config.root_path.clone();
            let cfg = run_blocking("logging_config_set", move || {
                let mut cfg = netpilot_logging::fs::read_config(&root);
                cfg.enabled = req.enabled;
                cfg.level = req.level;
                netpilot_logging::fs::write_config_atomic(&root, &cfg)
                    .map_err(|e| io_error("logging_config_set", e))?;
                Ok::<_, DaemonError>(cfg)
            })
            .await?;
            if let Err(err) = netpilot_logging::apply(&cfg) {
                debug!("Live logging reload skipped: {}", err);
            }
            Ok(ResponseOk::LoggingConfig(logging_response(&cfg)))
        }
    }
}

fn logging_response(cfg: &LoggingConfig) -> LoggingConfigResponse {
    LoggingConfigResponse {
        enabled: cfg.enabled,
        level: cfg.level.clone(),
        keep_days: cfg.keep_days,
    }
}

async fn kernel_routes() -> Result<ResponseOk, DaemonError> {
    let routes = netpilot_netlink::list_routes().await.map_err(|err| {
        DaemonError::new(ErrorCode::Netlink, "failed to list kernel routes", true)
            .with_detail(err.to_string())
            .with_source("daemon.dispatch.kernel_routes")
    })?;
    Ok(ResponseOk::KernelRoutes(KernelRoutesResponse {
        routes: routes
            .into_iter()
            .map(|r| KernelRoute {
                destination: r.destination,
                prefix_len: r.prefix_len,
                gateway: r.gateway,
                interface_index: r.interface_index,
                metric: r.metric,
                table: r.table,
            })
            .collect(),
    }))
}
