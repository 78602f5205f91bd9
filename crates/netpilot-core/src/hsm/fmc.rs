//! Fixed-mobile convergence: while enabled, a mobile connection that comes
//! up under wifi takes the default route and wifi keeps only its subnet
//! routes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::message::Message;
use super::{Disposition, StateId};
use crate::connectivity::Connectivity;
use crate::tracker::TrackerEvent;
use crate::types::{DetailedState, NetworkType, State};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FmcStatus {
    #[default]
    Disabled,
    Enabled,
    Active,
}

fn is_disconnect(info: &crate::types::NetworkInfo) -> bool {
    matches!(info.state, State::Disconnected | State::Suspended)
        && info.detailed_state != DetailedState::Idle
}

fn restore_wifi(ctx: &mut Connectivity) {
    let wifi = NetworkType::WIFI;
    if let Some(lp) = ctx.registry.current_lp(wifi).cloned() {
        let metric = ctx.registry.attrs(wifi).and_then(|a| a.metric);
        ctx.reconciler.restore_default_routes(&lp, metric);
    }
    if ctx.is_connected(wifi) {
        ctx.active_default = Some(wifi);
        ctx.inet.primary.reset(Some(wifi));
        ctx.handle_dns_configuration_change(wifi);
    } else {
        ctx.active_default = None;
        ctx.inet.primary.reset(None);
    }
}

pub(crate) fn enter_initial(ctx: &mut Connectivity) {
    if ctx.fmc == FmcStatus::Active {
        ctx.fmc = FmcStatus::Enabled;
    }
}

pub(crate) fn handle_initial(ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    match msg {
        Message::StartFmc => {
            info!("FMC enabled");
            ctx.fmc = FmcStatus::Enabled;
            Disposition::Handled
        }
        Message::StopFmc => {
            info!("FMC disabled");
            ctx.fmc = FmcStatus::Disabled;
            Disposition::Handled
        }
        Message::Tracker(TrackerEvent::StateChanged(info))
            if info.network_type == NetworkType::MOBILE
                && info.state == State::Connected
                && ctx.fmc == FmcStatus::Enabled
                && ctx.active_default == Some(NetworkType::WIFI) =>
        {
            Disposition::DeferTo(StateId::FmcActive)
        }
        _ => Disposition::NotHandled,
    }
}

pub(crate) fn enter_active(ctx: &mut Connectivity) {
    ctx.fmc = FmcStatus::Active;
    if let Some(lp) = ctx.registry.current_lp(NetworkType::WIFI).cloned() {
        info!(target: "route", "FMC active, pulling wifi default routes");
        ctx.reconciler.remove_default_routes(&lp);
    }
}

pub(crate) fn handle_active(ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    match msg {
        Message::StartFmc => Disposition::Handled,
        Message::StopFmc => {
            info!("FMC stopped, returning default to wifi");
            restore_wifi(ctx);
            ctx.teardown(NetworkType::MOBILE);
            ctx.fmc = FmcStatus::Disabled;
            Disposition::DeferTo(StateId::FmcInitial)
        }
        Message::Tracker(TrackerEvent::StateChanged(info)) => {
            let info = info.clone();
            match info.network_type {
                NetworkType::MOBILE if info.state == State::Connected => {
                    ctx.active_default = Some(NetworkType::MOBILE);
                    ctx.inet.primary.reset(Some(NetworkType::MOBILE));
                    ctx.complete_connect(&info);
                    Disposition::Handled
                }
                NetworkType::MOBILE if is_disconnect(&info) => {
                    debug!("Mobile left during FMC");
                    restore_wifi(ctx);
                    Disposition::DeferTo(StateId::FmcInitial)
                }
                NetworkType::WIFI if is_disconnect(&info) => {
                    Disposition::DeferTo(StateId::FmcInitial)
                }
                _ => Disposition::NotHandled,
            }
        }
        _ => Disposition::NotHandled,
    }
}
