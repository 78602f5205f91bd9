use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use netpilot_core::{
    DnsOverride, DnsSnapshot, FeatureUser, FmcStatus, LinkProperties, NetworkInfo, NetworkType,
    ProxyInfo, Snapshot, UidRule, WakelockStatus,
};
use netpilot_ipc::{
    endpoint_for_body, read_frame, write_frame, AckResponse, AuthzSummary, BroadcastRecord,
    BroadcastsRequest, ClientHello, DaemonError, DataDependencyRequest, FeatureFlag,
    FeatureRequest, FeatureStartResponse, FeatureStopResponse, HealthResponse, HelloAck,
    InetConditionRequest, KernelRoute, LoggingConfigResponse, LoggingConfigSetRequest,
    NetworkTypeRequest, PolicyDataRequest, ProcessDiedRequest, ProxySetRequest, RadioRequest,
    RadiosRequest, RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope, ResponseOk,
    RouteToHostRequest, SetEnabledRequest, StatusResponse, UidRuleRequest, UidRuleSetRequest,
    VersionResponse, WakelockRequest, MAX_FRAME, PROTOCOL_VERSION,
};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRY_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What the daemon told us during the handshake.
#[derive(Debug, Clone)]
pub struct DaemonClientInfo {
    pub daemon_version: String,
    pub protocol_version: u32,
    pub features: Vec<FeatureFlag>,
    pub authz: AuthzSummary,
    pub max_frame: u32,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub client_name: String,
    pub client_version: String,
    pub request_timeout: Duration,
    pub long_request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/netpilot/netpilotd.sock"),
            client_name: "netpilot-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            long_request_timeout: LONG_REQUEST_TIMEOUT,
            max_retries: MAX_RETRY_ATTEMPTS,
            retry_delay_ms: INITIAL_RETRY_DELAY.as_millis() as u64,
        }
    }
}

pub struct DaemonClient {
    stream: Option<UnixStream>,
    next_request_id: AtomicU64,
    info: Option<DaemonClientInfo>,
    config: ClientConfig,
}

impl DaemonClient {
    pub async fn connect<P: AsRef<Path>>(
        path: P,
        client_name: &str,
        client_version: &str,
    ) -> Result<Self> {
        let config = ClientConfig {
            socket_path: path.as_ref().to_path_buf(),
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            ..Default::default()
        };
        Self::connect_with_config(config).await
    }

    pub async fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let mut client = Self::new_disconnected(config);
        client.reconnect().await?;
        Ok(client)
    }

    pub fn new_disconnected(config: ClientConfig) -> Self {
        Self {
            stream: None,
            next_request_id: AtomicU64::new(1),
            info: None,
            config,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let mut stream = UnixStream::connect(&self.config.socket_path)
            .await
            .map_err(|err| connection_error(err, &self.config.socket_path))?;

        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
            client_version: self.config.client_version.clone(),
            supports: Vec::new(),
        };
        let hello_bytes = serde_json::to_vec(&hello)?;
        write_frame(&mut stream, &hello_bytes, MAX_FRAME).await?;

        let ack_bytes = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream, MAX_FRAME))
            .await
            .context("handshake timed out")??;
        let ack: HelloAck = match serde_json::from_slice(&ack_bytes) {
            Ok(ack) => ack,
            Err(_) => {
                // A refused handshake comes back as an error envelope instead.
                if let Ok(envelope) = serde_json::from_slice::<ResponseEnvelope>(&ack_bytes) {
                    if let ResponseBody::Err(err) = envelope.body {
                        return Err(daemon_error(err));
                    }
                }
                bail!("malformed handshake reply");
            }
        };
        if ack.protocol_version != PROTOCOL_VERSION {
            bail!(
                "protocol mismatch: client={} daemon={}",
                PROTOCOL_VERSION,
                ack.protocol_version
            );
        }

        tracing::debug!(
            daemon_version = %ack.daemon_version,
            role = ?ack.authz.role,
            "Connected to netpilotd"
        );
        self.info = Some(DaemonClientInfo {
            daemon_version: ack.daemon_version,
            protocol_version: ack.protocol_version,
            features: ack.features,
            authz: ack.authz,
            max_frame: ack.max_frame,
        });
        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn info(&self) -> Option<&DaemonClientInfo> {
        self.info.as_ref()
    }

    pub async fn ensure_connected(&mut self) -> Result<()> {
        if !self.is_connected() {
            self.reconnect().await?;
        }
        Ok(())
    }

    pub async fn request(&mut self, body: RequestBody) -> Result<ResponseBody> {
        self.request_with_timeout(body, self.config.request_timeout)
            .await
    }

    pub async fn request_long(&mut self, body: RequestBody) -> Result<ResponseBody> {
        self.request_with_timeout(body, self.config.long_request_timeout)
            .await
    }

    /// Sends `body`, reconnecting and retrying with exponential backoff when
    /// the transport fails. Daemon-side errors are returned, not retried.
    pub async fn request_with_timeout(
        &mut self,
        body: RequestBody,
        req_timeout: Duration,
    ) -> Result<ResponseBody> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.config.max_retries {
            if attempts > 0 {
                let delay = Duration::from_millis(
                    self.config.retry_delay_ms * (1u64 << (attempts - 1).min(4)),
                );
                sleep(delay).await;
            }

            match self.try_request(&body, req_timeout).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let should_retry = is_retryable_error(&err);
                    last_error = Some(err);
                    if !should_retry {
                        break;
                    }
                    attempts += 1;
                    if attempts < self.config.max_retries {
                        self.stream = None;
                        if let Err(e) = self.reconnect().await {
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("request failed with no error")))
    }

    async fn try_request(
        &mut self,
        body: &RequestBody,
        req_timeout: Duration,
    ) -> Result<ResponseBody> {
        self.ensure_connected().await?;

        let stream = self.stream.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        let info = self.info.as_ref().ok_or_else(|| anyhow!("no info"))?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope {
            v: info.protocol_version,
            request_id,
            endpoint: endpoint_for_body(body),
            body: body.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        write_frame(stream, &payload, info.max_frame).await?;

        let response_bytes = timeout(req_timeout, read_frame(stream, info.max_frame))
            .await
            .context("response timed out")??;
        let response: ResponseEnvelope = serde_json::from_slice(&response_bytes)?;
        if response.request_id != request_id {
            bail!(
                "response request_id mismatch: expected {} got {}",
                request_id,
                response.request_id
            );
        }
        if response.v != info.protocol_version {
            bail!(
                "protocol version mismatch: expected {} got {}",
                info.protocol_version,
                response.v
            );
        }
        Ok(response.body)
    }

    async fn call(&mut self, body: RequestBody) -> Result<ResponseOk> {
        into_ok(self.request(body).await?)
    }

    async fn call_ack(&mut self, body: RequestBody) -> Result<AckResponse> {
        match self.call(body).await? {
            ResponseOk::Ack(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    async fn call_bool(&mut self, body: RequestBody) -> Result<bool> {
        match self.call(body).await? {
            ResponseOk::Bool(resp) => Ok(resp.value),
            _ => Err(unexpected()),
        }
    }

    pub async fn health(&mut self) -> Result<HealthResponse> {
        match self.call(RequestBody::Health).await? {
            ResponseOk::Health(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn version(&mut self) -> Result<VersionResponse> {
        match self.call(RequestBody::Version).await? {
            ResponseOk::Version(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn status(&mut self) -> Result<StatusResponse> {
        match self.call(RequestBody::Status).await? {
            ResponseOk::Status(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn snapshot(&mut self) -> Result<Snapshot> {
        match self.call(RequestBody::SnapshotGet).await? {
            ResponseOk::Snapshot(snapshot) => Ok(*snapshot),
            _ => Err(unexpected()),
        }
    }

    pub async fn active_network_info(&mut self) -> Result<Option<NetworkInfo>> {
        match self.call(RequestBody::ActiveNetworkInfoGet).await? {
            ResponseOk::NetworkInfo(resp) => Ok(resp.info),
            _ => Err(unexpected()),
        }
    }

    pub async fn network_info(&mut self, network_type: NetworkType) -> Result<Option<NetworkInfo>> {
        let body = RequestBody::NetworkInfoGet(NetworkTypeRequest { network_type });
        match self.call(body).await? {
            ResponseOk::NetworkInfo(resp) => Ok(resp.info),
            _ => Err(unexpected()),
        }
    }

    pub async fn all_network_info(&mut self) -> Result<Vec<NetworkInfo>> {
        match self.call(RequestBody::AllNetworkInfoGet).await? {
            ResponseOk::NetworkInfoList(resp) => Ok(resp.networks),
            _ => Err(unexpected()),
        }
    }

    pub async fn active_link_properties(&mut self) -> Result<Option<LinkProperties>> {
        match self.call(RequestBody::ActiveLinkPropertiesGet).await? {
            ResponseOk::LinkProperties(resp) => Ok(resp.link),
            _ => Err(unexpected()),
        }
    }

    pub async fn link_properties(
        &mut self,
        network_type: NetworkType,
    ) -> Result<Option<LinkProperties>> {
        let body = RequestBody::LinkPropertiesGet(NetworkTypeRequest { network_type });
        match self.call(body).await? {
            ResponseOk::LinkProperties(resp) => Ok(resp.link),
            _ => Err(unexpected()),
        }
    }

    pub async fn is_active_network_metered(&mut self) -> Result<bool> {
        self.call_bool(RequestBody::ActiveNetworkMeteredGet).await
    }

    pub async fn is_network_supported(&mut self, network_type: NetworkType) -> Result<bool> {
        self.call_bool(RequestBody::NetworkSupportedGet(NetworkTypeRequest {
            network_type,
        }))
        .await
    }

    pub async fn network_preference(&mut self) -> Result<NetworkType> {
        match self.call(RequestBody::NetworkPreferenceGet).await? {
            ResponseOk::Preference(resp) => Ok(resp.network_type),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_network_preference(&mut self, network_type: NetworkType) -> Result<AckResponse> {
        self.call_ack(RequestBody::NetworkPreferenceSet(NetworkTypeRequest {
            network_type,
        }))
        .await
    }

    pub async fn start_using_network_feature(
        &mut self,
        network_type: NetworkType,
        feature: &str,
    ) -> Result<FeatureStartResponse> {
        let body = RequestBody::FeatureStart(FeatureRequest {
            network_type,
            feature: feature.to_string(),
        });
        match self.call(body).await? {
            ResponseOk::FeatureStarted(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn stop_using_network_feature(
        &mut self,
        network_type: NetworkType,
        feature: &str,
    ) -> Result<FeatureStopResponse> {
        let body = RequestBody::FeatureStop(FeatureRequest {
            network_type,
            feature: feature.to_string(),
        });
        match self.call(body).await? {
            ResponseOk::FeatureStopped(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn feature_users(&mut self) -> Result<Vec<FeatureUser>> {
        match self.call(RequestBody::FeatureUsersList).await? {
            ResponseOk::FeatureUsers(resp) => Ok(resp.users),
            _ => Err(unexpected()),
        }
    }

    /// Waits for the daemon to install (or refuse) the host route.
    pub async fn request_route_to_host(
        &mut self,
        network_type: NetworkType,
        address: IpAddr,
    ) -> Result<bool> {
        let body = RequestBody::RouteToHostRequest(RouteToHostRequest {
            network_type,
            address,
        });
        match into_ok(self.request_long(body).await?)? {
            ResponseOk::Bool(resp) => Ok(resp.value),
            _ => Err(unexpected()),
        }
    }

    pub async fn mobile_data_enabled(&mut self) -> Result<bool> {
        self.call_bool(RequestBody::MobileDataGet).await
    }

    pub async fn set_mobile_data_enabled(&mut self, enabled: bool) -> Result<AckResponse> {
        self.call_ack(RequestBody::MobileDataSet(SetEnabledRequest { enabled }))
            .await
    }

    pub async fn set_policy_data_enable(
        &mut self,
        network_type: NetworkType,
        enabled: bool,
    ) -> Result<AckResponse> {
        self.call_ack(RequestBody::PolicyDataEnableSet(PolicyDataRequest {
            network_type,
            enabled,
        }))
        .await
    }

    pub async fn report_inet_condition(
        &mut self,
        network_type: NetworkType,
        percentage: u8,
    ) -> Result<AckResponse> {
        self.call_ack(RequestBody::InetConditionReport(InetConditionRequest {
            network_type,
            percentage,
        }))
        .await
    }

    pub async fn set_data_dependency(
        &mut self,
        network_type: NetworkType,
        met: bool,
    ) -> Result<AckResponse> {
        self.call_ack(RequestBody::DataDependencySet(DataDependencyRequest {
            network_type,
            met,
        }))
        .await
    }

    pub async fn request_network_transition_wakelock(&mut self, for_what: &str) -> Result<bool> {
        self.call_bool(RequestBody::WakelockRequest(WakelockRequest {
            for_what: for_what.to_string(),
        }))
        .await
    }

    pub async fn wakelock_status(&mut self) -> Result<WakelockStatus> {
        match self.call(RequestBody::WakelockStatusGet).await? {
            ResponseOk::Wakelock(status) => Ok(status),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_radios(&mut self, on: bool) -> Result<bool> {
        self.call_bool(RequestBody::RadiosSet(RadiosRequest { on }))
            .await
    }

    pub async fn set_radio(&mut self, network_type: NetworkType, on: bool) -> Result<bool> {
        self.call_bool(RequestBody::RadioSet(RadioRequest { network_type, on }))
            .await
    }

    pub async fn global_proxy(&mut self) -> Result<Option<ProxyInfo>> {
        match self.call(RequestBody::GlobalProxyGet).await? {
            ResponseOk::Proxy(resp) => Ok(resp.proxy),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_global_proxy(&mut self, proxy: Option<ProxyInfo>) -> Result<AckResponse> {
        self.call_ack(RequestBody::GlobalProxySet(ProxySetRequest { proxy }))
            .await
    }

    /// The proxy applications should use: global when set, else the default
    /// network's.
    pub async fn proxy(&mut self) -> Result<Option<ProxyInfo>> {
        match self.call(RequestBody::ProxyGet).await? {
            ResponseOk::Proxy(resp) => Ok(resp.proxy),
            _ => Err(unexpected()),
        }
    }

    pub async fn uid_rule(&mut self, uid: u32) -> Result<UidRule> {
        match self.call(RequestBody::UidRuleGet(UidRuleRequest { uid })).await? {
            ResponseOk::UidRule(resp) => Ok(resp.rule),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_uid_rule(&mut self, uid: u32, rule: UidRule) -> Result<UidRule> {
        let body = RequestBody::UidRuleSet(UidRuleSetRequest { uid, rule });
        match self.call(body).await? {
            ResponseOk::UidRule(resp) => Ok(resp.rule),
            _ => Err(unexpected()),
        }
    }

    pub async fn start_fmc(&mut self) -> Result<AckResponse> {
        self.call_ack(RequestBody::FmcStart).await
    }

    pub async fn stop_fmc(&mut self) -> Result<AckResponse> {
        self.call_ack(RequestBody::FmcStop).await
    }

    pub async fn fmc_status(&mut self) -> Result<FmcStatus> {
        match self.call(RequestBody::FmcStatusGet).await? {
            ResponseOk::Fmc(resp) => Ok(resp.status),
            _ => Err(unexpected()),
        }
    }

    pub async fn switch_connectivity(&mut self, network_type: NetworkType) -> Result<AckResponse> {
        self.call_ack(RequestBody::SwitchConnectivity(NetworkTypeRequest {
            network_type,
        }))
        .await
    }

    pub async fn reprioritize_dns(&mut self, network_type: NetworkType) -> Result<AckResponse> {
        self.call_ack(RequestBody::ReprioritizeDns(NetworkTypeRequest {
            network_type,
        }))
        .await
    }

    pub async fn process_died(&mut self, pid: u32) -> Result<AckResponse> {
        self.call_ack(RequestBody::ProcessDied(ProcessDiedRequest { pid }))
            .await
    }

    pub async fn dns(&mut self) -> Result<DnsSnapshot> {
        match self.call(RequestBody::DnsGet).await? {
            ResponseOk::Dns(snapshot) => Ok(snapshot),
            _ => Err(unexpected()),
        }
    }

    pub async fn override_dns(&mut self, dns: DnsOverride) -> Result<AckResponse> {
        self.call_ack(RequestBody::DnsOverrideSet(dns)).await
    }

    pub async fn restore_dns(&mut self) -> Result<AckResponse> {
        self.call_ack(RequestBody::DnsRestore).await
    }

    pub async fn reload_settings(&mut self) -> Result<AckResponse> {
        self.call_ack(RequestBody::SettingsReload).await
    }

    pub async fn recent_broadcasts(&mut self, limit: usize) -> Result<Vec<BroadcastRecord>> {
        let body = RequestBody::BroadcastsRecent(BroadcastsRequest { limit });
        match self.call(body).await? {
            ResponseOk::Broadcasts(resp) => Ok(resp.broadcasts),
            _ => Err(unexpected()),
        }
    }

    pub async fn kernel_routes(&mut self) -> Result<Vec<KernelRoute>> {
        match self.call(RequestBody::KernelRoutesList).await? {
            ResponseOk::KernelRoutes(resp) => Ok(resp.routes),
            _ => Err(unexpected()),
        }
    }

    pub async fn logging_config(&mut self) -> Result<LoggingConfigResponse> {
        match self.call(RequestBody::LoggingConfigGet).await? {
            ResponseOk::LoggingConfig(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_logging_config(
        &mut self,
        enabled: bool,
        level: &str,
    ) -> Result<LoggingConfigResponse> {
        let body = RequestBody::LoggingConfigSet(LoggingConfigSetRequest {
            enabled,
            level: level.to_string(),
        });
        match self.call(body).await? {
            ResponseOk::LoggingConfig(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }
}

fn into_ok(body: ResponseBody) -> Result<ResponseOk> {
    match body {
        ResponseBody::Ok(ok) => Ok(ok),
        ResponseBody::Err(err) => Err(daemon_error(err)),
        ResponseBody::Event(_) => Err(anyhow!("unexpected event frame")),
    }
}

fn unexpected() -> anyhow::Error {
    anyhow!("unexpected response body")
}

fn connection_error(err: std::io::Error, socket_path: &Path) -> anyhow::Error {
    use std::io::ErrorKind;

    let socket_display = socket_path.display();
    let hint = match err.kind() {
        ErrorKind::NotFound => "the socket does not exist; is netpilotd running?",
        ErrorKind::PermissionDenied => {
            "permission denied; the caller must be root or in the socket's group"
        }
        ErrorKind::ConnectionRefused => "nothing is listening; netpilotd may have stopped",
        _ if socket_path.exists() => "the socket exists but the connection failed",
        _ => "the socket does not exist; is netpilotd running?",
    };
    anyhow::Error::new(err).context(format!(
        "failed to connect to netpilotd at {}: {}",
        socket_display, hint
    ))
}

fn daemon_error(err: DaemonError) -> anyhow::Error {
    let message = err.to_string();
    let final_message = if err.retryable {
        format!("{} (retryable)", message)
    } else {
        message
    };
    anyhow!(final_message).context(err.code.to_string())
}

fn is_retryable_error(err: &anyhow::Error) -> bool {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );
    }
    let text = err.to_string();
    text.contains("retryable") || text.contains("timed out")
}
