pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME: u32 = 1_048_576;

mod authz;
mod error;
mod types;
mod wire;

pub use authz::{AuthorizationTier, AuthzSummary};
pub use error::{DaemonError, ErrorCode};
pub use types::{
    endpoint_for_body, AckResponse, BoolResponse, BroadcastRecord, BroadcastsRequest,
    BroadcastsResponse, ClientHello, DaemonEvent, DataDependencyRequest, Endpoint, FeatureFlag,
    FeatureRequest, FeatureStartResponse, FeatureStopResponse, FeatureUsersResponse,
    FmcStatusResponse, HealthResponse, HelloAck, InetConditionRequest, KernelRoute,
    KernelRoutesResponse, LinkPropertiesResponse, LoggingConfigResponse, LoggingConfigSetRequest,
    NetworkInfoListResponse, NetworkInfoResponse, NetworkTypeRequest, PolicyDataRequest,
    PreferenceResponse, ProcessDiedRequest, ProxyResponse, ProxySetRequest, RadioRequest,
    RadiosRequest, RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope, ResponseOk,
    RouteToHostRequest, SetEnabledRequest, StatusResponse, UidRuleRequest, UidRuleResponse,
    UidRuleSetRequest, VersionResponse, WakelockRequest,
};
pub use wire::{decode_frame_length, encode_frame, read_frame, write_frame, FrameError};
