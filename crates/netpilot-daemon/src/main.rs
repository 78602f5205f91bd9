#![deny(unsafe_op_in_unsafe_fn)]

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use netpilot_daemon::config::DaemonConfig;
use netpilot_daemon::state::Daemon;
use netpilot_daemon::{monitor, reaper, server, settings_watch, socket};

const COMPONENT: &str = "netpilotd";

// The connectivity worker is its own thread; two runtime workers are enough
// for socket handling and the background tasks.
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_env();
    let log_cfg = netpilot_logging::fs::read_config(&config.root_path);
    let _logging_guards = netpilot_logging::init(COMPONENT, &config.root_path, &log_cfg)?;

    install_panic_hook();

    let _log_watcher = match netpilot_logging::spawn_watcher(&config.root_path) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Logging watcher disabled: {}", err);
            None
        }
    };

    let span = tracing::info_span!("netpilotd", component = COMPONENT);
    let _span_guard = span.enter();

    let listener = socket::bind_socket(&config.socket_path, config.socket_group.as_deref())
        .with_context(|| format!("binding {}", config.socket_path.display()))?;

    let build_config = config.clone();
    let daemon = tokio::task::spawn_blocking(move || Daemon::build(build_config))
        .await
        .context("daemon startup panicked")??;
    let state = Arc::clone(&daemon.state);

    let global_cancel = CancellationToken::new();
    spawn_retention_task(config.root_path.clone(), global_cancel.clone());
    reaper::spawn_reaper(Arc::clone(&state), global_cancel.clone());

    let monitor_handle = tokio::spawn(monitor::run_interface_monitor(
        Arc::clone(&state),
        global_cancel.clone(),
    ));
    let settings_handle =
        match settings_watch::spawn_settings_watcher(Arc::clone(&state), global_cancel.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Settings watcher disabled: {:#}", err);
                None
            }
        };

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGTERM handler: {}", err);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGINT handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            },
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            },
        }

        shutdown_signal.notify_waiters();
    });

    info!("netpilotd ready on {}", config.socket_path.display());
    server::run(listener, Arc::clone(&state), Arc::clone(&shutdown)).await;

    info!("Starting graceful shutdown...");
    global_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), monitor_handle).await;
    if let Some(handle) = settings_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    // Joins the worker after it drains its queue.
    let service = daemon.service;
    if tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .is_err()
    {
        warn!("Connectivity service shutdown panicked");
    }
    remove_socket(&config.socket_path);

    info!("netpilotd stopped");
    Ok(())
}

fn remove_socket(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), err);
        }
    }
}

fn spawn_retention_task(root: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Log retention task stopped by shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let root = root.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let cfg = netpilot_logging::fs::read_config(&root);
                        netpilot_logging::run_retention(&root, COMPONENT, &cfg)
                    })
                    .await;
                    match result {
                        Ok(Ok(0)) => {}
                        Ok(Ok(removed)) => info!("Log retention removed {} file(s)", removed),
                        Ok(Err(err)) => warn!("Log retention failed: {:#}", err),
                        Err(err) => warn!("Log retention task panicked: {}", err),
                    }
                }
            }
        }
    });
}

/// Logs panics with location and backtrace before the default hook runs.
fn install_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let backtrace = std::backtrace::Backtrace::capture();
        error!(
            target: "netpilotd::panic",
            location = %location,
            message = %message,
            "PANIC: daemon panicked"
        );
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            error!(target: "netpilotd::panic", backtrace = %backtrace, "Panic backtrace");
        } else {
            error!(
                target: "netpilotd::panic",
                "Backtrace not available (set RUST_BACKTRACE=1 to enable)"
            );
        }

        default_hook(panic_info);
    }));
}
