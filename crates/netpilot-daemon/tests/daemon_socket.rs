#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::Notify;

use netpilot_client::{ClientConfig, DaemonClient};
use netpilot_core::{NetworkType, Variant};
use netpilot_daemon::{config::DaemonConfig, server, state::Daemon};
use netpilot_ipc::{AuthorizationTier, ErrorCode, NetworkTypeRequest, RequestBody, ResponseBody};

#[tokio::test(flavor = "current_thread")]
async fn status_queries_and_tier_checks_over_the_socket() {
    let root = tempfile::tempdir().expect("tempdir");
    let socket_path = root.path().join("netpilotd.sock");

    let mut config = DaemonConfig::from_env();
    config.socket_path = socket_path.clone();
    config.root_path = root.path().to_path_buf();
    config.kernel_routes = false;
    config.interfaces = Vec::new();
    config.interface_dns = HashMap::new();
    config.admin_group = "netpilot-test-admin-nobody".to_string();
    config.operator_group = "netpilot-test-operator-nobody".to_string();

    let daemon = tokio::task::spawn_blocking(move || Daemon::build(config))
        .await
        .expect("join build")
        .expect("build daemon");
    let listener = UnixListener::bind(&socket_path).expect("bind socket");

    let shutdown = Arc::new(Notify::new());
    let server_state = Arc::clone(&daemon.state);
    let server_shutdown = Arc::clone(&shutdown);
    let server_task = tokio::spawn(async move {
        server::run(listener, server_state, server_shutdown).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = DaemonClient::connect_with_config(ClientConfig {
        socket_path: socket_path.clone(),
        client_name: "daemon-test".to_string(),
        client_version: "test".to_string(),
        ..Default::default()
    })
    .await
    .expect("connect");
    let authz = client.info().expect("handshake info").authz.clone();

    let health = client.health().await.expect("health");
    assert!(health.ok);

    let status = client.status().await.expect("status");
    assert_eq!(status.variant, Variant::Single);
    assert!(status.trackers.is_empty());
    assert_eq!(status.active_default, None);
    assert_eq!(status.network_preference, NetworkType::WIFI);

    let active = client.active_network_info().await.expect("active info");
    assert_eq!(active, None);
    assert!(client.all_network_info().await.expect("all info").is_empty());

    // Configured in the default table, but nothing tracks it.
    let supported = client
        .is_network_supported(NetworkType::WIFI)
        .await
        .expect("supported");
    assert!(!supported);

    let response = client
        .request(RequestBody::NetworkInfoGet(NetworkTypeRequest {
            network_type: NetworkType::WIMAX,
        }))
        .await
        .expect("network info request");
    match response {
        ResponseBody::Err(err) => assert_eq!(err.code, ErrorCode::NotSupported),
        other => panic!("expected not supported, got {other:?}"),
    }

    let response = client
        .request(RequestBody::SwitchConnectivity(NetworkTypeRequest {
            network_type: NetworkType::ETHERNET,
        }))
        .await
        .expect("switch request");
    if authz.role < AuthorizationTier::Admin {
        match response {
            ResponseBody::Err(err) => assert_eq!(err.code, ErrorCode::Forbidden),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    let records = client.recent_broadcasts(8).await.expect("broadcasts");
    assert!(records.len() <= 8);
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));

    shutdown.notify_waiters();
    let _ = server_task.await;
    let service = daemon.service;
    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .expect("service shutdown");
}
