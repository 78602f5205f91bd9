use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, Semaphore};
use tokio::time;
use tracing::{debug, instrument, warn, Instrument};

use netpilot_ipc::{
    endpoint_for_body, read_frame, write_frame, AuthzSummary, ClientHello, DaemonError,
    ErrorCode, FeatureFlag, HelloAck, RequestEnvelope, ResponseBody, ResponseEnvelope,
    PROTOCOL_VERSION,
};

use crate::auth::{authorization_for_peer, peer_credentials, required_tier, tier_allows};
use crate::dispatch::handle_request;
use crate::state::DaemonState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_PROTOCOL_VIOLATIONS: usize = 3;
const ERROR_REQUEST_ID: u64 = 0;

fn build_feature_list() -> Vec<FeatureFlag> {
    vec![
        FeatureFlag::UdsTimeouts,
        FeatureFlag::GroupBasedAuth,
        FeatureFlag::BroadcastHistory,
        FeatureFlag::KernelRoutes,
    ]
}

async fn read_frame_timed(
    stream: &mut UnixStream,
    max_frame: u32,
    timeout_duration: Duration,
) -> io::Result<Vec<u8>> {
    match time::timeout(timeout_duration, read_frame(stream, max_frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "frame read timeout")),
    }
}

async fn write_frame_timed(
    stream: &mut UnixStream,
    payload: &[u8],
    max_frame: u32,
    timeout_duration: Duration,
) -> io::Result<()> {
    match time::timeout(timeout_duration, write_frame(stream, payload, max_frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "frame write timeout")),
    }
}

pub async fn run(listener: UnixListener, state: Arc<DaemonState>, shutdown: Arc<Notify>) {
    let max_connections = state.config.max_connections.max(1);
    let conn_limit = Arc::new(Semaphore::new(max_connections));
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                break;
            }
            result = listener.accept() => {
                let (stream, _addr) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("Accept error: {}", err);
                        continue;
                    }
                };

                let permit = match conn_limit.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, rejecting");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, state).await;
                });
            }
        }
    }
}

/// Per-connection token bucket, refilled once a second.
struct RateLimit {
    max: u32,
    tokens: u32,
    last_refill: Instant,
}

impl RateLimit {
    fn new(max: u32) -> Self {
        Self {
            max,
            tokens: max,
            last_refill: Instant::now(),
        }
    }

    fn take(&mut self) -> bool {
        if self.max == 0 {
            return true;
        }
        if self.last_refill.elapsed() >= Duration::from_secs(1) {
            self.tokens = self.max;
            self.last_refill = Instant::now();
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

#[instrument(skip(stream, state), fields(pid, uid, gid, tier))]
async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) {
    let peer = match peer_credentials(&stream) {
        Ok(cred) => cred,
        Err(err) => {
            warn!("Failed to read peer credentials: {}", err);
            return;
        }
    };

    let span = tracing::Span::current();
    span.record("pid", peer.pid);
    span.record("uid", peer.uid);
    span.record("gid", peer.gid);

    let authz = authorization_for_peer(&peer, &state.config);
    span.record("tier", format!("{:?}", authz).as_str());

    debug!("New connection accepted");

    let mut stream = stream;
    let max_frame = state.config.max_frame;
    let write_timeout = state.config.write_timeout;

    let hello_payload = match time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream, max_frame))
        .await
    {
        Ok(Ok(payload)) => payload,
        Ok(Err(err)) => {
            warn!("Handshake frame error: {}", err);
            return;
        }
        Err(_) => {
            warn!("Handshake timed out from pid {}", peer.pid);
            return;
        }
    };

    let hello: ClientHello = match serde_json::from_slice(&hello_payload) {
        Ok(hello) => hello,
        Err(err) => {
            let _ = send_error_timed(
                &mut stream,
                ERROR_REQUEST_ID,
                protocol_violation(format!("invalid hello: {}", err)),
                max_frame,
                write_timeout,
            )
            .await;
            return;
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let _ = send_error_timed(
            &mut stream,
            ERROR_REQUEST_ID,
            DaemonError::new(
                ErrorCode::IncompatibleProtocol,
                format!("unsupported protocol {}", hello.protocol_version),
                false,
            ),
            max_frame,
            write_timeout,
        )
        .await;
        return;
    }
    debug!("Hello from {} {}", hello.client_name, hello.client_version);

    let ack = HelloAck {
        protocol_version: PROTOCOL_VERSION,
        daemon_version: state.version.clone(),
        features: build_feature_list(),
        max_frame,
        authz: AuthzSummary {
            uid: peer.uid,
            gid: peer.gid,
            pid: peer.pid,
            role: authz,
        },
    };

    let ack_bytes = match serde_json::to_vec(&ack) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to serialize hello ack: {}", err);
            return;
        }
    };

    if let Err(err) = write_frame_timed(&mut stream, &ack_bytes, max_frame, write_timeout).await {
        warn!("Failed to send hello ack: {}", err);
        return;
    }

    let mut rate = RateLimit::new(state.config.max_requests_per_second);
    let mut violations = 0usize;

    loop {
        let payload =
            match read_frame_timed(&mut stream, max_frame, state.config.read_timeout).await {
                Ok(payload) => payload,
                Err(err) => {
                    if err.kind() == io::ErrorKind::TimedOut {
                        debug!("Idle connection from pid {} timed out", peer.pid);
                        let _ = send_error_timed(
                            &mut stream,
                            ERROR_REQUEST_ID,
                            DaemonError::new(ErrorCode::Timeout, "read timeout", true),
                            max_frame,
                            write_timeout,
                        )
                        .await;
                    } else if err.kind() != io::ErrorKind::UnexpectedEof {
                        warn!("Frame read error from pid {}: {}", peer.pid, err);
                    }
                    break;
                }
            };

        let request: RequestEnvelope = match serde_json::from_slice(&payload) {
            Ok(req) => req,
            Err(err) => {
                violations += 1;
                let _ = send_error_timed(
                    &mut stream,
                    ERROR_REQUEST_ID,
                    protocol_violation(format!("invalid request: {}", err)),
                    max_frame,
                    write_timeout,
                )
                .await;
                if violations >= MAX_PROTOCOL_VIOLATIONS {
                    warn!("Too many protocol violations from pid {}", peer.pid);
                    break;
                }
                continue;
            }
        };

        let rejection = if request.v != PROTOCOL_VERSION {
            violations += 1;
            Some(DaemonError::new(
                ErrorCode::IncompatibleProtocol,
                "protocol version mismatch",
                false,
            ))
        } else if request.endpoint != endpoint_for_body(&request.body) {
            violations += 1;
            Some(protocol_violation("endpoint/body mismatch"))
        } else if !rate.take() {
            Some(DaemonError::new(ErrorCode::Busy, "rate limit exceeded", true))
        } else if !tier_allows(authz, required_tier(request.endpoint)) {
            let required = required_tier(request.endpoint);
            Some(
                DaemonError::new(ErrorCode::Forbidden, "forbidden", false)
                    .with_detail(format!("{:?} requires {:?}", request.endpoint, required)),
            )
        } else {
            None
        };
        if let Some(err) = rejection {
            let _ = send_error_timed(&mut stream, request.request_id, err, max_frame, write_timeout)
                .await;
            if violations >= MAX_PROTOCOL_VIOLATIONS {
                warn!("Too many protocol violations from pid {}", peer.pid);
                break;
            }
            continue;
        }

        let start = Instant::now();
        let request_span = tracing::info_span!(
            "request",
            request_id = request.request_id,
            endpoint = ?request.endpoint,
            duration_ms = tracing::field::Empty,
        );
        request_span.in_scope(|| debug!("Processing request"));
        let response = handle_request(&state, request, peer)
            .instrument(request_span.clone())
            .await;

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to serialize response: {}", err);
                break;
            }
        };

        if let Err(err) = write_frame_timed(&mut stream, &payload, max_frame, write_timeout).await {
            if err.kind() == io::ErrorKind::TimedOut {
                warn!(
                    "Response write timeout to pid {} for request {}",
                    peer.pid, response.request_id
                );
            } else {
                warn!("Failed to write response: {}", err);
            }
            break;
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        request_span.record("duration_ms", duration_ms);
        debug!(parent: &request_span, duration_ms, "Request completed");
    }
}

fn protocol_violation(err: impl Into<String>) -> DaemonError {
    DaemonError::new(ErrorCode::BadRequest, err, false)
}

async fn send_error_timed(
    stream: &mut UnixStream,
    request_id: u64,
    err: DaemonError,
    max_frame: u32,
    timeout_duration: Duration,
) -> Result<()> {
    let envelope = ResponseEnvelope {
        v: PROTOCOL_VERSION,
        request_id,
        body: ResponseBody::Err(err),
    };
    let payload = serde_json::to_vec(&envelope)?;
    write_frame_timed(stream, &payload, max_frame, timeout_duration).await?;
    Ok(())
}
