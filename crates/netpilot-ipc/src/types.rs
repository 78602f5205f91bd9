use std::net::IpAddr;

use netpilot_core::{
    Broadcast, DnsOverride, DnsSnapshot, FeatureUser, FmcStatus, LinkProperties, NetworkInfo,
    NetworkType, ProxyInfo, Snapshot, StartResult, StateId, StopResult, UidRule, Variant,
    WakelockStatus,
};
use serde::{Deserialize, Serialize};

use crate::{AuthzSummary, DaemonError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    UdsTimeouts,
    GroupBasedAuth,
    BroadcastHistory,
    KernelRoutes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_name: String,
    pub client_version: String,
    pub supports: Vec<FeatureFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub protocol_version: u32,
    pub daemon_version: String,
    pub features: Vec<FeatureFlag>,
    pub max_frame: u32,
    pub authz: AuthzSummary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Health,
    Version,
    Status,
    SnapshotGet,
    ActiveNetworkInfoGet,
    NetworkInfoGet,
    AllNetworkInfoGet,
    ActiveLinkPropertiesGet,
    LinkPropertiesGet,
    ActiveNetworkMeteredGet,
    NetworkSupportedGet,
    NetworkPreferenceGet,
    NetworkPreferenceSet,
    FeatureStart,
    FeatureStop,
    FeatureUsersList,
    RouteToHostRequest,
    MobileDataGet,
    MobileDataSet,
    PolicyDataEnableSet,
    InetConditionReport,
    DataDependencySet,
    WakelockRequest,
    WakelockStatusGet,
    RadiosSet,
    RadioSet,
    GlobalProxyGet,
    GlobalProxySet,
    ProxyGet,
    UidRuleGet,
    UidRuleSet,
    FmcStart,
    FmcStop,
    FmcStatusGet,
    SwitchConnectivity,
    ReprioritizeDns,
    ProcessDied,
    DnsGet,
    DnsOverrideSet,
    DnsRestore,
    SettingsReload,
    BroadcastsRecent,
    KernelRoutesList,
    LoggingConfigGet,
    LoggingConfigSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u32,
    pub request_id: u64,
    pub endpoint: Endpoint,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RequestBody {
    Health,
    Version,
    Status,
    SnapshotGet,
    ActiveNetworkInfoGet,
    NetworkInfoGet(NetworkTypeRequest),
    AllNetworkInfoGet,
    ActiveLinkPropertiesGet,
    LinkPropertiesGet(NetworkTypeRequest),
    ActiveNetworkMeteredGet,
    NetworkSupportedGet(NetworkTypeRequest),
    NetworkPreferenceGet,
    NetworkPreferenceSet(NetworkTypeRequest),
    FeatureStart(FeatureRequest),
    FeatureStop(FeatureRequest),
    FeatureUsersList,
    RouteToHostRequest(RouteToHostRequest),
    MobileDataGet,
    MobileDataSet(SetEnabledRequest),
    PolicyDataEnableSet(PolicyDataRequest),
    InetConditionReport(InetConditionRequest),
    DataDependencySet(DataDependencyRequest),
    WakelockRequest(WakelockRequest),
    WakelockStatusGet,
    RadiosSet(RadiosRequest),
    RadioSet(RadioRequest),
    GlobalProxyGet,
    GlobalProxySet(ProxySetRequest),
    ProxyGet,
    UidRuleGet(UidRuleRequest),
    UidRuleSet(UidRuleSetRequest),
    FmcStart,
    FmcStop,
    FmcStatusGet,
    SwitchConnectivity(NetworkTypeRequest),
    ReprioritizeDns(NetworkTypeRequest),
    ProcessDied(ProcessDiedRequest),
    DnsGet,
    DnsOverrideSet(DnsOverride),
    DnsRestore,
    SettingsReload,
    BroadcastsRecent(BroadcastsRequest),
    KernelRoutesList,
    LoggingConfigGet,
    LoggingConfigSet(LoggingConfigSetRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseBody {
    Ok(ResponseOk),
    Err(DaemonError),
    Event(DaemonEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseOk {
    Health(HealthResponse),
    Version(VersionResponse),
    Status(StatusResponse),
    Snapshot(Box<Snapshot>),
    NetworkInfo(NetworkInfoResponse),
    NetworkInfoList(NetworkInfoListResponse),
    LinkProperties(LinkPropertiesResponse),
    Bool(BoolResponse),
    Preference(PreferenceResponse),
    FeatureStarted(FeatureStartResponse),
    FeatureStopped(FeatureStopResponse),
    FeatureUsers(FeatureUsersResponse),
    Wakelock(WakelockStatus),
    Proxy(ProxyResponse),
    UidRule(UidRuleResponse),
    Fmc(FmcStatusResponse),
    Dns(DnsSnapshot),
    Broadcasts(BroadcastsResponse),
    KernelRoutes(KernelRoutesResponse),
    LoggingConfig(LoggingConfigResponse),
    Ack(AckResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DaemonEvent {
    Broadcast(BroadcastRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub uptime_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub daemon_version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime_ms: u64,
    pub variant: Variant,
    pub state: StateId,
    pub active_default: Option<NetworkType>,
    pub network_preference: NetworkType,
    pub trackers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkTypeRequest {
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfoResponse {
    pub info: Option<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfoListResponse {
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPropertiesResponse {
    pub link: Option<LinkProperties>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoolResponse {
    pub value: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreferenceResponse {
    pub network_type: NetworkType,
}

/// The caller's pid and uid come from the socket's peer credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub network_type: NetworkType,
    pub feature: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureStartResponse {
    pub result: StartResult,
    pub code: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureStopResponse {
    pub result: StopResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureUsersResponse {
    pub users: Vec<FeatureUser>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouteToHostRequest {
    pub network_type: NetworkType,
    pub address: IpAddr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyDataRequest {
    pub network_type: NetworkType,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InetConditionRequest {
    pub network_type: NetworkType,
    pub percentage: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataDependencyRequest {
    pub network_type: NetworkType,
    pub met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakelockRequest {
    pub for_what: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadiosRequest {
    pub on: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadioRequest {
    pub network_type: NetworkType,
    pub on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySetRequest {
    pub proxy: Option<ProxyInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub proxy: Option<ProxyInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UidRuleRequest {
    pub uid: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UidRuleSetRequest {
    pub uid: u32,
    pub rule: UidRule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UidRuleResponse {
    pub uid: u32,
    pub rule: UidRule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FmcStatusResponse {
    pub status: FmcStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessDiedRequest {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BroadcastsRequest {
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub seq: u64,
    pub at_ms: u64,
    pub broadcast: Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastsResponse {
    pub broadcasts: Vec<BroadcastRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelRoute {
    pub destination: Option<IpAddr>,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub interface_index: Option<u32>,
    pub metric: Option<u32>,
    pub table: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelRoutesResponse {
    pub routes: Vec<KernelRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfigResponse {
    pub enabled: bool,
    pub level: String,
    pub keep_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfigSetRequest {
    pub enabled: bool,
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub message: String,
}

impl AckResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn endpoint_for_body(body: &RequestBody) -> Endpoint {
    match body {
        RequestBody::Health => Endpoint::Health,
        RequestBody::Version => Endpoint::Version,
        RequestBody::Status => Endpoint::Status,
        RequestBody::SnapshotGet => Endpoint::SnapshotGet,
        RequestBody::ActiveNetworkInfoGet => Endpoint::ActiveNetworkInfoGet,
        RequestBody::NetworkInfoGet(_) => Endpoint::NetworkInfoGet,
        RequestBody::AllNetworkInfoGet => Endpoint::AllNetworkInfoGet,
        RequestBody::ActiveLinkPropertiesGet => Endpoint::ActiveLinkPropertiesGet,
        RequestBody::LinkPropertiesGet(_) => Endpoint::LinkPropertiesGet,
        RequestBody::ActiveNetworkMeteredGet => Endpoint::ActiveNetworkMeteredGet,
        RequestBody::NetworkSupportedGet(_) => Endpoint::NetworkSupportedGet,
        RequestBody::NetworkPreferenceGet => Endpoint::NetworkPreferenceGet,
        RequestBody::NetworkPreferenceSet(_) => Endpoint::NetworkPreferenceSet,
        RequestBody::FeatureStart(_) => Endpoint::FeatureStart,
        RequestBody::FeatureStop(_) => Endpoint::FeatureStop,
        RequestBody::FeatureUsersList => Endpoint::FeatureUsersList,
        RequestBody::RouteToHostRequest(_) => Endpoint::RouteToHostRequest,
        RequestBody::MobileDataGet => Endpoint::MobileDataGet,
        RequestBody::MobileDataSet(_) => Endpoint::MobileDataSet,
        RequestBody::PolicyDataEnableSet(_) => Endpoint::PolicyDataEnableSet,
        RequestBody::InetConditionReport(_) => Endpoint::InetConditionReport,
        RequestBody::DataDependencySet(_) => Endpoint::DataDependencySet,
        RequestBody::WakelockRequest(_) => Endpoint::WakelockRequest,
        RequestBody::WakelockStatusGet => Endpoint::WakelockStatusGet,
        RequestBody::RadiosSet(_) => Endpoint::RadiosSet,
        RequestBody::RadioSet(_) => Endpoint::RadioSet,
        RequestBody::GlobalProxyGet => Endpoint::GlobalProxyGet,
        RequestBody::GlobalProxySet(_) => Endpoint::GlobalProxySet,
        RequestBody::ProxyGet => Endpoint::ProxyGet,
        RequestBody::UidRuleGet(_) => Endpoint::UidRuleGet,
        RequestBody::UidRuleSet(_) => Endpoint::UidRuleSet,
        RequestBody::FmcStart => Endpoint::FmcStart,
        RequestBody::FmcStop => Endpoint::FmcStop,
        RequestBody::FmcStatusGet => Endpoint::FmcStatusGet,
        RequestBody::SwitchConnectivity(_) => Endpoint::SwitchConnectivity,
        RequestBody::ReprioritizeDns(_) => Endpoint::ReprioritizeDns,
        RequestBody::ProcessDied(_) => Endpoint::ProcessDied,
        RequestBody::DnsGet => Endpoint::DnsGet,
        RequestBody::DnsOverrideSet(_) => Endpoint::DnsOverrideSet,
        RequestBody::DnsRestore => Endpoint::DnsRestore,
        RequestBody::SettingsReload => Endpoint::SettingsReload,
        RequestBody::BroadcastsRecent(_) => Endpoint::BroadcastsRecent,
        RequestBody::KernelRoutesList => Endpoint::KernelRoutesList,
        RequestBody::LoggingConfigGet => Endpoint::LoggingConfigGet,
        RequestBody::LoggingConfigSet(_) => Endpoint::LoggingConfigSet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_is_tagged() {
        let body = RequestBody::NetworkPreferenceSet(NetworkTypeRequest {
            network_type: NetworkType::WIFI,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "NetworkPreferenceSet");
        assert_eq!(json["data"]["network_type"], 1);
        assert_eq!(endpoint_for_body(&body), Endpoint::NetworkPreferenceSet);
    }

    #[test]
    fn unit_bodies_decode_without_data() {
        let body: RequestBody = serde_json::from_str(r#"{"type":"FmcStart"}"#).unwrap();
        assert_eq!(endpoint_for_body(&body), Endpoint::FmcStart);
    }

    #[test]
    fn endpoint_names_are_snake_case() {
        let json = serde_json::to_value(Endpoint::RouteToHostRequest).unwrap();
        assert_eq!(json, "route_to_host_request");
    }
}
