use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_log::LogTracer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::targets::{file_name, SUBSYSTEMS, T_DNS, T_HSM, T_NET, T_ROUTE};

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Keeps the non-blocking file writers alive; drop it last.
pub struct LoggingGuards {
    _file_guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber: stdout, `<root>/logs/<component>.log`, and
/// one file per subsystem target. Messages with a subsystem target go only to
/// that subsystem's file and stdout.
pub fn init(component: &str, root: &Path, cfg: &LoggingConfig) -> Result<LoggingGuards> {
    let filter = build_filter(cfg);
    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = RELOAD.set(handle);

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact();

    let log_dir = root.join("logs");
    let mut warn_msg: Option<String> = None;

    let base = tracing_subscriber::registry()
        .with(filter_layer)
        .with(ErrorLayer::default())
        .with(stdout_layer);

    let mut guards = Vec::new();

    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        base.try_init().ok();
        let _ = LogTracer::init();
        tracing::warn!("File logging disabled ({}): {}", log_dir.display(), err);
        return Ok(LoggingGuards {
            _file_guards: guards,
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) =
            std::fs::set_permissions(&log_dir, std::fs::Permissions::from_mode(0o2750))
        {
            warn_msg = Some(format!(
                "Failed to set log directory permissions ({}): {}",
                log_dir.display(),
                err
            ));
        }
    }

    let component_appender = tracing_appender::rolling::daily(&log_dir, file_name(component));
    let (component_writer, component_guard) = tracing_appender::non_blocking(component_appender);
    let component_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_writer(component_writer)
        .with_filter(component_targets());
    guards.push(component_guard);

    let (net_layer, net_guard) = subsystem_layer(&log_dir, T_NET);
    let (route_layer, route_guard) = subsystem_layer(&log_dir, T_ROUTE);
    let (dns_layer, dns_guard) = subsystem_layer(&log_dir, T_DNS);
    let (hsm_layer, hsm_guard) = subsystem_layer(&log_dir, T_HSM);
    guards.extend([net_guard, route_guard, dns_guard, hsm_guard]);

    let registry = base
        .with(component_layer)
        .with(net_layer)
        .with(route_layer)
        .with(dns_layer)
        .with(hsm_layer);

    registry.try_init().ok();
    let _ = LogTracer::init();

    if let Some(message) = warn_msg {
        tracing::warn!("{message}");
    }

    Ok(LoggingGuards {
        _file_guards: guards,
    })
}

/// Swaps the live filter for the one `cfg` describes.
pub fn apply(cfg: &LoggingConfig) -> Result<()> {
    let handle = RELOAD
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging not initialized"))?;
    handle.reload(build_filter(cfg))?;
    tracing::info!(
        "Logging reconfigured (enabled={}, level={})",
        cfg.enabled,
        cfg.level
    );
    Ok(())
}

pub(crate) fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    if !cfg.enabled {
        return EnvFilter::new("off");
    }
    EnvFilter::try_new(cfg.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn component_targets() -> Targets {
    SUBSYSTEMS.iter().fold(
        Targets::new().with_default(LevelFilter::TRACE),
        |targets, target| targets.with_target(*target, LevelFilter::OFF),
    )
}

fn subsystem_layer<S>(
    log_dir: &Path,
    target: &'static str,
) -> (impl tracing_subscriber::Layer<S> + Send + Sync, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::daily(log_dir, file_name(target));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_writer(writer)
        .with_filter(Targets::new().with_target(target, LevelFilter::TRACE));
    (layer, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_turns_everything_off() {
        let cfg = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&cfg).max_level_hint(), Some(LevelFilter::OFF));
    }

    #[test]
    fn bad_directive_falls_back_to_info() {
        let cfg = LoggingConfig {
            level: "route=notalevel".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&cfg).max_level_hint(), Some(LevelFilter::INFO));
    }
}
